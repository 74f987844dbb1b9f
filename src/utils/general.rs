use std::cmp::Ordering;

//////////////////
// VECTOR STUFF //
//////////////////

/// Get the maximum and minimum value of an array
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// Tuple of values with the first being the minimum and the second the maximum
pub fn array_max_min<T: PartialOrd + Copy>(arr: &[T]) -> (T, T) {
    arr.iter().skip(1).fold((arr[0], arr[0]), |(lo, hi), &v| {
        (if v < lo { v } else { lo }, if v > hi { v } else { hi })
    })
}

/// Total order for floats that sorts NaN to the end
#[inline]
pub fn cmp_f32(a: &f32, b: &f32) -> Ordering {
    a.partial_cmp(b).unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}

/// Median of a slice of floats
///
/// ### Params
///
/// * `x` - The values. An empty slice yields `0.0`.
///
/// ### Returns
///
/// The (upper) median
pub fn median_f32(x: &[f32]) -> f32 {
    if x.is_empty() {
        return 0.0;
    }
    let mut sorted = x.to_vec();
    sorted.sort_by(cmp_f32);
    sorted[sorted.len() / 2]
}

/// Moving average over a histogram with integer counts
///
/// ### Params
///
/// * `data` - The histogram counts
/// * `window` - Window size (centred)
///
/// ### Returns
///
/// The smoothed histogram
pub fn moving_average(data: &[usize], window: usize) -> Vec<usize> {
    let half_window = window / 2;
    data.iter()
        .enumerate()
        .map(|(i, _)| {
            let start = i.saturating_sub(half_window);
            let end = (i + half_window + 1).min(data.len());
            let sum: usize = data[start..end].iter().sum();
            sum / (end - start)
        })
        .collect()
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_max_min() {
        let (min, max) = array_max_min(&[3.0_f32, -1.0, 7.5, 2.0]);
        assert_eq!(min, -1.0);
        assert_eq!(max, 7.5);
    }

    #[test]
    fn test_median_with_nan_last() {
        let x = [f32::NAN, 1.0, 3.0, 2.0];
        assert_eq!(median_f32(&x), 3.0);
        assert_eq!(median_f32(&[]), 0.0);
    }

    #[test]
    fn test_moving_average() {
        let smoothed = moving_average(&[0, 3, 6, 3, 0], 3);
        assert_eq!(smoothed, vec![1, 3, 4, 3, 1]);
    }
}
