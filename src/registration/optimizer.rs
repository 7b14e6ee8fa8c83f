/// Derivative-free coordinate pattern search.
///
/// Each sweep tries `+step` and `-step` (times the parameter's scale) on
/// every coordinate in turn and keeps the first improvement. A sweep
/// without any improvement halves the step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct PatternSearch {
    pub initial_step: f64,
    pub min_step: f64,
    pub max_sweeps: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SearchResult {
    pub params: Vec<f64>,
    pub value: f64,
    pub sweeps: usize,
    pub converged: bool,
}

impl PatternSearch {
    pub fn minimize(
        &self,
        start: Vec<f64>,
        scales: &[f64],
        mut cost: impl FnMut(&[f64]) -> f64,
        mut on_sweep: impl FnMut(usize),
    ) -> SearchResult {
        let mut params = start;
        let mut best = cost(&params);
        let mut step = self.initial_step;
        let mut sweeps = 0;
        let mut converged = false;

        while sweeps < self.max_sweeps {
            sweeps += 1;
            let mut improved = false;
            for i in 0..params.len() {
                for direction in [1.0, -1.0] {
                    let original = params[i];
                    params[i] = original + direction * step * scales[i];
                    let value = cost(&params);
                    if value < best {
                        best = value;
                        improved = true;
                        break;
                    }
                    params[i] = original;
                }
            }
            on_sweep(sweeps);

            if !improved {
                step *= 0.5;
                if step < self.min_step {
                    converged = true;
                    break;
                }
            }
        }

        SearchResult {
            params,
            value: best,
            sweeps,
            converged,
        }
    }
}
