use sha2::{Digest, Sha256};

use crate::condition::Temperature;
use crate::prompt::ChatMessage;

/// Cache key for one model call.
///
/// Covers exactly the inputs that determine the output distribution: model
/// id, rendered messages (canonical JSON), temperature, plus the sample index
/// (run number) so repeated runs stay independent draws. Request metadata
/// such as timestamps or attempt numbers is never part of the key.
pub fn fingerprint(
    model: &str,
    messages: &[ChatMessage],
    temperature: Temperature,
    sample: u32,
) -> String {
    let canonical = serde_jcs::to_string(messages)
        .or_else(|_| serde_json::to_string(messages))
        .unwrap_or_default();

    let mut h = Sha256::new();
    h.update(model.as_bytes());
    h.update(b"\n");
    h.update(canonical.as_bytes());
    h.update(b"\n");
    h.update(temperature.to_string().as_bytes());
    h.update(b"\n");
    h.update(sample.to_string().as_bytes());
    hex::encode(h.finalize())
}
