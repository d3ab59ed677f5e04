/// Generate a pseudo-logarithmic integer series of dark times, in buffer slots.
///
/// Points cluster near `min` and thin out towards `max`, where the relaxation
/// signal changes slowly. The series starts at `min`, never exceeds `max` and
/// never repeats a value; it ends early (shorter than `n`) once a candidate
/// reaches `max`. With `n <= 1`, or with `max <= min`, only `min` is returned.
pub fn gen_log_space(min: u32, max: u32, n: usize) -> Vec<u32> {
    let mut result = vec![min];
    if n <= 1 || max <= min {
        return result;
    }

    let exponent = f64::from(max).log10() / (n - 1) as f64;
    for i in 1..n {
        let prev = result[result.len() - 1];
        let cand = u64::from(min) + 10f64.powf(i as f64 * exponent).round() as u64;
        let next = if cand > u64::from(prev) {
            cand
        } else {
            // collision with the previous point: step one slot past it
            u64::from(prev) + 1
        };
        if next >= u64::from(max) {
            result.push(max);
            break;
        }
        result.push(next as u32);
    }
    result
}
