mod contracts;
mod ledger;

use tally_config::{SubmitterConfig, TallyConfig};
use tally_crypto::LatticeParams;
use tally_protocol::AskerKeys;

use crate::ledger::TransientMap;

/// Small homomorphic modulus keeps key generation fast
pub(crate) const TEST_BITS: u64 = 512;

pub(crate) fn asker_keys() -> AskerKeys {
    AskerKeys::generate(TEST_BITS, LatticeParams::MlKem768).unwrap()
}

pub(crate) fn test_config() -> TallyConfig {
    let mut config = TallyConfig::default();
    config.crypto.homomorphic_bits = TEST_BITS;
    config.submitter = SubmitterConfig {
        max_retries: 10,
        backoff_base_ms: 1,
        jitter_step_ms: 1,
        jitter_steps: 5,
    };
    config.query.operators = 3;
    config.query.participants = 2;
    config.query.duration_secs = 60;
    config.query.grace_secs = 0;
    config.sandbox.operators = 3;
    config.sandbox.participants = 2;
    config
}

pub(crate) fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub(crate) fn transient(fields: &[(&str, Vec<u8>)]) -> TransientMap {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}
