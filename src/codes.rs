//! Integer response codes understood by the orchestration layer.
//!
//! Backend codes arrive in the `Code` field of every JSON response body.
//! Local codes are negative so they can never collide with a backend value.

/// Plain success.
pub const RESPONSE_OK: i64 = 1000;
/// Success for batch endpoints (every item carries its own code).
pub const MULTI_RESPONSE_OK: i64 = 1001;

/// In-body signal that the access token expired, for transports that mask
/// the HTTP status.
pub const AUTH_SESSION_EXPIRED: i64 = 401;

/// Human verification must be completed before the request is accepted.
pub const HUMAN_VERIFICATION_REQUIRED: i64 = 9001;

/// The client application version is no longer supported.
pub const BAD_APP_VERSION: i64 = 5003;
/// The API version requested by the client is no longer supported.
pub const BAD_API_VERSION: i64 = 5005;

/// The refresh endpoint rejected a token because of a local cache
/// inconsistency; retrying the refresh usually succeeds.
pub const AUTH_LOCAL_CACHE_BAD: i64 = 10013;

pub const INVALID_VERIFICATION_CODE: i64 = 12087;
pub const TOO_MANY_VERIFICATION_CODES: i64 = 12214;
pub const TOO_MANY_FAILED_VERIFICATION_ATTEMPTS: i64 = 85131;
pub const HUMAN_VERIFICATION_ADDRESS_ALREADY_TAKEN: i64 = 2500;

/// Codes that mean "the verification token was rejected, show the UI again".
pub const VERIFICATION_REJECTION_CODES: [i64; 5] = [
    INVALID_VERIFICATION_CODE,
    TOO_MANY_VERIFICATION_CODES,
    TOO_MANY_FAILED_VERIFICATION_ATTEMPTS,
    HUMAN_VERIFICATION_ADDRESS_ALREADY_TAKEN,
    HUMAN_VERIFICATION_REQUIRED,
];

/// Local: the request could not reach the backend and the failure looks like
/// censorship the routing layer could not work around.
pub const LOCAL_POTENTIALLY_BLOCKED: i64 = -1_000;
/// Local: no credential store is registered.
pub const LOCAL_NO_CREDENTIAL_STORE: i64 = -1_001;
/// Local: an authenticated call was attempted without a session.
pub const LOCAL_CREDENTIAL_NOT_FOUND: i64 = -1_002;
/// Local: the refresh attempt budget ran out.
pub const LOCAL_TOO_MANY_REFRESH_ATTEMPTS: i64 = -1_003;

/// Whether a body code is one of the success sentinels.
pub fn is_success(code: i64) -> bool {
    code == RESPONSE_OK || code == MULTI_RESPONSE_OK
}

/// Whether a body code asks the client to upgrade.
pub fn is_forced_upgrade(code: i64) -> bool {
    code == BAD_APP_VERSION || code == BAD_API_VERSION
}

pub fn is_verification_rejection(code: i64) -> bool {
    VERIFICATION_REJECTION_CODES.contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_sentinels() {
        assert!(is_success(1000));
        assert!(is_success(1001));
        assert!(!is_success(1002));
    }

    #[test]
    fn local_codes_never_collide_with_backend_codes() {
        for code in [
            LOCAL_POTENTIALLY_BLOCKED,
            LOCAL_NO_CREDENTIAL_STORE,
            LOCAL_CREDENTIAL_NOT_FOUND,
            LOCAL_TOO_MANY_REFRESH_ATTEMPTS,
        ] {
            assert!(code < 0);
        }
    }
}
