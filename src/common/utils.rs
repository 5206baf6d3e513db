pub const SLOT_NUM: usize = 16384;

pub trait ThreadSafe: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> ThreadSafe for T {}

// `offset` and `limit` come straight from the query string.
pub fn paginate<T>(items: Vec<T>, offset: Option<usize>, limit: Option<usize>) -> Vec<T> {
    let offset = offset.unwrap_or(0);
    match limit {
        Some(limit) => items.into_iter().skip(offset).take(limit).collect(),
        None => items.into_iter().skip(offset).collect(),
    }
}
