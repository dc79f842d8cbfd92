use crate::fragment::FragmentId;

use super::ConsolidationConfig;

/// Select the next fragments to consolidate from `fragments` (in creation order, with their sizes in bytes).
///
/// Chooses the contiguous run of fragments with the largest cardinality in `[step_min_frags, step_max_frags]` in which every pair of adjacent fragments has a size ratio (smaller over larger) of at least `step_size_ratio`.
/// Among runs of that cardinality the one with the smallest total size is chosen, but a later run replaces an earlier one only if it is more than 25% smaller.
///
/// Returns [`None`] if no run of at least two fragments qualifies.
#[must_use]
pub fn select_fragments(
    fragments: &[(FragmentId, u64)],
    config: &ConsolidationConfig,
) -> Option<Vec<FragmentId>> {
    let count = fragments.len();
    let max = usize::try_from(config.step_max_frags())
        .unwrap_or(usize::MAX)
        .min(count);
    let min = usize::try_from(config.step_min_frags())
        .unwrap_or(usize::MAX)
        .max(2);
    if max < min {
        return None;
    }

    let ratio_ok = |a: u64, b: u64| {
        #[allow(clippy::cast_precision_loss)]
        let (a, b) = (a as f64, b as f64);
        let ratio = if a <= b { a / b } else { b / a };
        // Two empty fragments are the same size
        let ratio = if ratio.is_nan() { 1.0 } else { ratio };
        ratio >= f64::from(config.step_size_ratio())
    };

    // `totals[j]` is the total size of the valid run of the current length starting at `j`
    let mut totals: Vec<Option<u64>> = fragments.iter().map(|(_, size)| Some(*size)).collect();
    let mut best: Option<(usize, usize)> = None;
    for length in 2..=max {
        let mut row = Vec::with_capacity(count + 1 - length);
        for start in 0..=count - length {
            let end = start + length - 1;
            let total = totals[start].and_then(|total| {
                ratio_ok(fragments[end - 1].1, fragments[end].1)
                    .then(|| total.saturating_add(fragments[end].1))
            });
            row.push(total);
        }
        if length >= min {
            let mut min_size: Option<u64> = None;
            let mut min_start = 0;
            for (start, total) in row.iter().enumerate() {
                let Some(total) = *total else { continue };
                #[allow(clippy::cast_precision_loss)]
                let smaller = min_size
                    .map_or(true, |min_size| (total as f64) < min_size as f64 / 1.25);
                if smaller {
                    min_size = Some(total);
                    min_start = start;
                }
            }
            if min_size.is_some() {
                best = Some((min_start, length));
            }
        }
        totals = row;
    }

    best.map(|(start, length)| {
        fragments[start..start + length]
            .iter()
            .map(|(fragment, _)| *fragment)
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(sizes: &[u64]) -> Vec<(FragmentId, u64)> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| (FragmentId::new(i as u64 + 1, i as u64 + 1), *size))
            .collect()
    }

    fn selected(fragments: &[(FragmentId, u64)], config: &ConsolidationConfig) -> Vec<usize> {
        select_fragments(fragments, config)
            .unwrap_or_default()
            .iter()
            .map(|id| fragments.iter().position(|(f, _)| f == id).unwrap())
            .collect()
    }

    #[test]
    fn select_all() {
        let config = ConsolidationConfig::default();
        let fragments = fragments(&[10, 20, 30]);
        assert_eq!(selected(&fragments, &config), vec![0, 1, 2]);
        assert!(select_fragments(&fragments[..1], &config).is_none());
        assert!(select_fragments(&[], &config).is_none());
    }

    #[test]
    fn select_max_frags() {
        let mut config = ConsolidationConfig::default();
        config.set_step_max_frags(2);
        // Prefer the earliest run unless a later one is more than 25% smaller
        assert_eq!(selected(&fragments(&[10, 10, 9, 9]), &config), vec![0, 1]);
        assert_eq!(selected(&fragments(&[10, 10, 5, 5]), &config), vec![2, 3]);
    }

    #[test]
    fn select_size_ratio() {
        let mut config = ConsolidationConfig::default();
        config.set_step_size_ratio(0.5);
        assert_eq!(selected(&fragments(&[100, 10, 12, 15]), &config), vec![1, 2, 3]);
        config.set_step_size_ratio(1.0);
        assert!(select_fragments(&fragments(&[100, 10, 12, 15]), &config).is_none());
    }

    #[test]
    fn select_min_frags() {
        let mut config = ConsolidationConfig::default();
        config.set_step_min_frags(3).set_step_size_ratio(0.5);
        assert!(select_fragments(&fragments(&[100, 10, 100, 10]), &config).is_none());
        config.set_step_min_frags(1);
        assert!(select_fragments(&fragments(&[100, 10, 100, 10]), &config).is_none());
        assert_eq!(selected(&fragments(&[100, 10, 10, 100]), &config), vec![1, 2]);
    }
}
