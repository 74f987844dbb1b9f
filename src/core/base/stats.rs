use statrs::function::gamma::ln_gamma;

///////////////
// Functions //
///////////////

/// Calculate the p-value of a hypergeometric test.
///
/// Upper tail, i.e. the probability of drawing more than `q` white balls.
/// By convention `q == 0` returns `1.0` rather than P(X > 0), so a community
/// without any simulated doublets is never enriched.
///
/// ### Params
///
/// * `q` - Number of white balls drawn
/// * `m` - Number of white balls in the urn
/// * `n` - Number of black balls in the urn
/// * `k` - Number of balls drawn from the urn
///
/// ### Return
///
/// The p-value of the hypergeometric test
#[inline]
pub fn hypergeom_pval(q: usize, m: usize, n: usize, k: usize) -> f64 {
    if q == 0 {
        return 1.0;
    }

    let population = m + n;
    let (n_f, m_f, k_f) = (n as f64, m as f64, k as f64);
    let population_f = population as f64;

    let upper = k.min(m);

    let log_probs: Vec<f64> = ((q + 1)..=upper)
        .filter(|&i| k - i <= n)
        .map(|i| {
            let i_f = i as f64;
            ln_gamma(m_f + 1.0) - ln_gamma(i_f + 1.0) - ln_gamma(m_f - i_f + 1.0)
                + ln_gamma(n_f + 1.0)
                - ln_gamma(k_f - i_f + 1.0)
                - ln_gamma(n_f - (k_f - i_f) + 1.0)
                - (ln_gamma(population_f + 1.0)
                    - ln_gamma(k_f + 1.0)
                    - ln_gamma(population_f - k_f + 1.0))
        })
        .collect();

    if log_probs.is_empty() {
        return 0.0;
    }

    // log-sum-exp
    let max_log_prob = log_probs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let sum: f64 = log_probs
        .iter()
        .map(|log_p| (log_p - max_log_prob).exp())
        .sum();

    (sum * max_log_prob.exp()).min(1.0)
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hypergeom_against_closed_form() {
        // urn with 5 white, 5 black, draw 4; P(X > 2) = P(X = 3) + P(X = 4)
        // = (C(5,3) * C(5,1) + C(5,4) * C(5,0)) / C(10,4) = (50 + 5) / 210
        let p = hypergeom_pval(2, 5, 5, 4);
        assert!((p - 55.0 / 210.0).abs() < 1e-10);
    }

    #[test]
    fn test_hypergeom_edges() {
        // no white balls drawn is not tested for enrichment
        assert_eq!(hypergeom_pval(0, 5, 5, 4), 1.0);
        assert_eq!(hypergeom_pval(0, 9, 1, 4), 1.0);
        // Cannot draw more than 4 white balls when drawing 4
        assert_eq!(hypergeom_pval(4, 5, 5, 4), 0.0);
    }
}
