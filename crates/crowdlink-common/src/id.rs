use uuid::Uuid;

/// Generate a fresh client identifier.
///
/// A v4 UUID string; collision probability is negligible, so ids are
/// never checked for uniqueness anywhere else.
pub fn new_client_id() -> String {
    Uuid::new_v4().to_string()
}
