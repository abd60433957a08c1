//! Session token lifecycle.
//!
//! This module provides:
//! - `claims`: unverified decoding of token payloads
//! - `TokenStore`: durable single-slot storage of the current credential pair
//! - `RotationLedger`: bounded per-subject history of refresh-token rotations
//! - `RefreshCoordinator`: at most one in-flight refresh per refresh token
//! - `SessionManager`: restore, login, scheduled renewal and logout
//! - `AuthGate`: admission checks for protected views
//!
//! Access tokens are renewed 60 seconds before they expire.

pub mod claims;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod session;
pub mod store;

pub use claims::{Claims, ClaimsError};
pub use coordinator::RefreshCoordinator;
pub use error::{AuthError, RefreshError};
pub use gate::{AuthGate, GateDecision};
pub use ledger::{RotationEntry, RotationLedger};
pub use session::{
    EndReason, RenewalPolicy, SessionEvent, SessionManager, SessionPhase, SessionSnapshot,
    TokenStatus,
};
pub use store::{CredentialPair, FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};
