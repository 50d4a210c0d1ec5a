//! Commonly used types
//!
//! ```rust
//! use ztdf::prelude::*;
//!
//! let config = TdfConfig::new()
//!     .kas(KasInfo::new("https://kas.example.com"))
//!     .policy(PolicyBuilder::new().dissem("user@example.com").build());
//! assert!(config.resolve_split_plan().is_ok());
//! ```

pub use crate::archive::Zip64Mode;
pub use crate::assertion::{
    AppliesToState, Assertion, AssertionConfig, AssertionRegistry, AssertionType,
    AssertionValidator, AssertionVerificationKeys, AssertionVerificationMode, Scope, Statement,
    Validator, VerificationContext,
};
pub use crate::config::{KasInfo, ReaderConfig, SplitPlanResolver, SplitStep, TargetMode, TdfConfig};
pub use crate::crypto::{Dek, EcCurve, IntegrityAlgorithm, JwsKey};
pub use crate::error::{TamperKind, TdfError};
pub use crate::kas::{AccessTokenSource, KasClient, SessionKeyType, StaticTokenSource};
pub use crate::manifest::{KeyAccess, Manifest};
pub use crate::policy::{AttributeObject, Policy, PolicyBuilder};
pub use crate::segment::{ReaderState, TdfReader, TdfWriter};
pub use crate::tdf::{
    Tdf, TdfDecryptBuilder, TdfDecryptFileBuilder, TdfEncryptBuilder, TdfEncryptFileBuilder,
};
