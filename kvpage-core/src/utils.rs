#[macro_export]
macro_rules! get_mut_arcmutex {
    ($thing:expr) => {
        loop {
            if let Ok(inner) = $thing.lock() {
                break inner;
            }
        }
    };
}

/// Smallest power of two that is `>= x`, with `pow2_roundup(0) == 1`.
pub(crate) fn pow2_roundup(x: usize) -> usize {
    x.max(1).next_power_of_two()
}

pub(crate) fn ceil_div(a: usize, b: usize) -> usize {
    a.div_ceil(b)
}
