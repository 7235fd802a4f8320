use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a generated correlation id.
pub const CORRELATION_ID_LEN: usize = 12;

/// Generates a random alphanumeric correlation id.
///
/// Each in-flight call gets a fresh id; the server echoes it back as the
/// `name` of the response frame so the client can match request to response.
pub fn correlation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_ID_LEN)
        .map(char::from)
        .collect()
}
