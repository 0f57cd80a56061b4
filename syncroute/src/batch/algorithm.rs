use config::shared::{BatchAlgorithm, ChannelPolicyConfig};

/// Batching settings of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub algorithm: BatchAlgorithm,
}

impl BatchSettings {
    pub fn new(max_batch_size: usize, algorithm: BatchAlgorithm) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            algorithm,
        }
    }

    /// Returns whether an open batch of `len` events must be finalized before the next event
    /// is added.
    ///
    /// Transactional channels only break at transaction boundaries. An event without a
    /// transaction id is its own transaction.
    pub(crate) fn completes_before(
        &self,
        len: usize,
        last_transaction_id: Option<&str>,
        next_transaction_id: Option<&str>,
    ) -> bool {
        if len < self.max_batch_size {
            return false;
        }

        match self.algorithm {
            BatchAlgorithm::Default | BatchAlgorithm::Nontransactional => true,
            BatchAlgorithm::Transactional => match (last_transaction_id, next_transaction_id) {
                (Some(last), Some(next)) => last != next,
                _ => true,
            },
        }
    }
}

impl From<&ChannelPolicyConfig> for BatchSettings {
    fn from(config: &ChannelPolicyConfig) -> Self {
        BatchSettings::new(config.max_batch_size, config.batch_algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit_applies_regardless_of_transactions() {
        for algorithm in [BatchAlgorithm::Default, BatchAlgorithm::Nontransactional] {
            let settings = BatchSettings::new(2, algorithm);

            assert!(!settings.completes_before(1, Some("t1"), Some("t1")));
            assert!(settings.completes_before(2, Some("t1"), Some("t1")));
        }
    }

    #[test]
    fn transactional_waits_for_boundary() {
        let settings = BatchSettings::new(2, BatchAlgorithm::Transactional);

        assert!(!settings.completes_before(5, Some("t1"), Some("t1")));
        assert!(settings.completes_before(2, Some("t1"), Some("t2")));
        assert!(settings.completes_before(2, None, None));
        assert!(!settings.completes_before(1, Some("t1"), Some("t2")));
    }
}
