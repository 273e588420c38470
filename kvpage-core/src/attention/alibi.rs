/// ALiBi slopes for `head_num` heads.
///
/// For a power of two `n` head `h` gets `2^(-8(h+1)/n)`. Otherwise the slopes of
/// the closest smaller power of two are followed by every other slope of the
/// next power of two.
pub fn alibi_slopes(head_num: usize) -> Vec<f32> {
    if head_num == 0 {
        return Vec::new();
    }
    let closest = 1usize << (usize::BITS - 1 - head_num.leading_zeros());
    let geometric = |n: usize| -> Vec<f32> {
        let base = 2f64.powf(-8. / n as f64);
        (1..=n).map(|i| base.powi(i as i32) as f32).collect()
    };
    let mut slopes = geometric(closest);
    if closest < head_num {
        let extra = geometric(2 * closest);
        slopes.extend(extra.into_iter().step_by(2).take(head_num - closest));
    }
    slopes
}
