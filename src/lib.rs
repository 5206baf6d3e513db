#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use(defer)]
extern crate scopeguard;
#[macro_use]
extern crate derivative;

pub mod broker;
pub mod common;
