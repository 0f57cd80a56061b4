use fail::FailScenario;

/// Failpoint configuration active until dropped.
///
/// Failpoints are process global, so tests using this must not run in parallel with other
/// failpoint tests.
pub struct FailpointScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> FailpointScenario<'a> {
    /// Configures each `(name, action)` pair, e.g. `("routing_pass.after_batches_finalized",
    /// "1*return(no_retry)")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> FailpointScenario<'a> {
        let scenario = FailScenario::setup();

        for (name, action) in failpoints {
            fail::cfg(*name, action).unwrap();
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints.iter().map(|(name, _)| name.to_string()).collect(),
        }
    }

    /// Turns one failpoint off before the scenario ends.
    pub fn disable(&self, name: &str) {
        fail::remove(name);
    }
}

impl Drop for FailpointScenario<'_> {
    fn drop(&mut self) {
        for name in &self.failpoints {
            fail::remove(name);
        }
    }
}
