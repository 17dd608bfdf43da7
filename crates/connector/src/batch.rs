/// Joint caps on one target batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
}

/// Pack items into batches, sealing a batch whenever appending the next
/// item would exceed either cap. An item larger than `max_bytes` on its own
/// becomes a single-item batch; items are never split.
pub fn pack<T>(
    items: impl IntoIterator<Item = T>,
    limits: &BatchLimits,
    size_of: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let mut batches = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_bytes = 0usize;

    for item in items {
        let bytes = size_of(&item);
        let over_count = current.len() + 1 > limits.max_count;
        let over_bytes = current_bytes + bytes > limits.max_bytes;

        if !current.is_empty() && (over_count || over_bytes) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += bytes;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
