//! Response classification plus the human verification and forced upgrade flows.

pub mod classifier;
pub mod coordinator;
pub mod human_verification;

pub use classifier::{ChallengeKind, Classification, TransportFault, classify, classify_response};
pub use coordinator::{ChallengeContext, ChallengeCoordinator, ChallengeResolution, VerificationTicket};
pub use human_verification::{
    CodeSubmissionHandler, ForceUpgradeDelegate, HumanVerificationDelegate,
    HumanVerificationParameters, VerificationOutcome, VerifyMethod,
};
