//! Trusted Data Format (TDF) containers
//!
//! A TDF is a ZIP archive holding an AES-256-GCM encrypted payload and a
//! JSON manifest. The payload key is split across one or more Key Access
//! Servers (KAS) and bound to an access policy; integrity signatures make
//! any modification of the payload, the manifest or its assertions
//! detectable.
//!
//! ```no_run
//! use std::io::Cursor;
//! use ztdf::prelude::*;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kas = KasClient::with_token("access-token")?;
//! let config = TdfConfig::new()
//!     .kas(KasInfo::new("https://kas.example.com"))
//!     .policy(Policy::new(vec![], vec!["user@example.com".into()]));
//! let tdf = Tdf::encrypt(b"secret".to_vec())
//!     .config(config)
//!     .kas_client(kas.clone())
//!     .to_bytes()
//!     .await?;
//!
//! let mut reader = TdfReader::new(Cursor::new(tdf))?;
//! reader
//!     .unlock(&kas, &ReaderConfig::new().kas_allowlist(["kas.example.com"]))
//!     .await?;
//! let mut plaintext = Vec::new();
//! reader.write_to(&mut plaintext)?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod assertion;
pub mod config;
pub mod crypto;
pub mod error;
pub mod kas;
pub mod key_access;
pub mod manifest;
pub mod policy;
pub mod prelude;
pub mod segment;
pub mod tdf;

pub use assertion::{
    Assertion, AssertionConfig, AssertionError, AssertionRegistry, AssertionVerificationKeys,
    AssertionVerificationMode,
};
pub use config::{KasInfo, ReaderConfig, SplitPlanResolver, SplitStep, TargetMode, TdfConfig};
pub use crypto::{Dek, IntegrityAlgorithm, JwsKey};
pub use error::{TamperKind, TdfError};
pub use kas::{KasClient, SessionKeyType};
pub use manifest::Manifest;
pub use policy::{AttributeObject, Policy, PolicyBuilder, PolicyError};
pub use segment::{TdfReader, TdfWriter};
pub use tdf::Tdf;
