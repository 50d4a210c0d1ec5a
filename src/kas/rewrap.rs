//! Recovering the DEK from the key access objects of a manifest
//!
//! Objects are grouped by KAS origin and each group goes out as one rewrap
//! request; groups run concurrently. A split is recovered as soon as any of
//! its objects is granted, so replicas (objects sharing a split id) cover
//! for each other. Every recovered fragment is checked against its policy
//! binding before it is used.

use super::allowlist::{normalize_kas_url, KasAllowlist};
use super::client::KasClient;
use super::protocol::{
    KeyAccessObjectWrapper, KeyAccessRewrapResult, PolicyRequest, RequestPolicy, RewrapResponse,
    UnsignedRewrapRequest,
};
use super::session::SessionKey;
use super::KasError;
use crate::config::ReaderConfig;
use crate::crypto::{CryptoError, Dek, KeyFragment};
use crate::error::{TamperKind, TdfError};
use crate::key_access::{decrypt_metadata, reconstruct_dek, verify_policy_binding};
use crate::manifest::Manifest;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Policy id sent with every rewrap request
pub const REWRAP_POLICY_ID: &str = "policy";

/// The recovered DEK plus any metadata the writer sealed for the reader
#[derive(Debug)]
pub struct UnwrappedKey {
    pub dek: Dek,
    pub metadata: Option<String>,
}

fn kao_id(index: usize) -> String {
    format!("kao-{index}")
}

struct KasGroup {
    origin: String,
    base_url: String,
    indices: Vec<usize>,
}

struct Failure {
    index: usize,
    reason: String,
    blocked: bool,
}

impl Failure {
    fn new(index: usize, reason: impl Into<String>) -> Self {
        Failure {
            index,
            reason: reason.into(),
            blocked: false,
        }
    }
}

fn unwrap_result(
    session: &SessionKey,
    result: &KeyAccessRewrapResult,
    session_public_key: Option<&str>,
) -> Result<KeyFragment, KasError> {
    let wrapped = result
        .wrapped_key()
        .ok_or_else(|| KasError::InvalidResponse("permit without a wrapped key".into()))?;
    let wrapped = BASE64.decode(wrapped).map_err(CryptoError::from)?;
    session.unwrap_fragment(&wrapped, session_public_key)
}

impl KasClient {
    /// Rewrap every split of `manifest` and recombine the DEK
    ///
    /// Fails with [`TdfError::KasNotAllowed`] when only allowlist rejections
    /// kept a split from being recovered, with [`TdfError::KasFailure`] when
    /// any split could not be recovered for another reason, and with
    /// [`TamperKind::PolicyBinding`] when a recovered fragment does not match
    /// the policy.
    pub async fn unwrap_dek(
        &self,
        manifest: &Manifest,
        config: &ReaderConfig,
    ) -> Result<UnwrappedKey, TdfError> {
        let key_access = manifest.key_access();
        let policy_b64 = &manifest.encryption_information.policy;

        let allowlist = if config.ignore_allowlist {
            warn!("KAS allowlist ignored; contacting every KAS named in the manifest");
            None
        } else {
            Some(
                KasAllowlist::new(&config.kas_allowlist)
                    .map_err(|e| TdfError::InvalidArgument(e.to_string()))?,
            )
        };

        let mut groups: Vec<KasGroup> = Vec::new();
        let mut failures: Vec<Failure> = Vec::new();
        for (index, kao) in key_access.iter().enumerate() {
            let origin = match normalize_kas_url(&kao.url) {
                Ok(origin) => origin,
                Err(e) => {
                    failures.push(Failure::new(index, e.to_string()));
                    continue;
                }
            };
            if let Some(list) = &allowlist {
                if !list.is_allowed(&kao.url) {
                    warn!(kas_url = %kao.url, "KAS is not on the allowlist");
                    failures.push(Failure {
                        index,
                        reason: format!("{} is not on the allowlist", kao.url),
                        blocked: true,
                    });
                    continue;
                }
            }
            match groups.iter_mut().find(|g| g.origin == origin) {
                Some(group) => group.indices.push(index),
                None => groups.push(KasGroup {
                    origin,
                    base_url: kao.url.clone(),
                    indices: vec![index],
                }),
            }
        }

        let mut unwrapped: Vec<(usize, KeyFragment)> = Vec::new();
        let mut task_errors: Vec<String> = Vec::new();
        if !groups.is_empty() {
            let session = match &config.session_key {
                Some(key) => key.clone(),
                None => SessionKey::generate(config.session_key_type)?,
            };
            let client_public_key = session.public_key_pem()?;

            let mut tasks = JoinSet::new();
            for (group_index, group) in groups.iter().enumerate() {
                let request = UnsignedRewrapRequest {
                    client_public_key: client_public_key.clone(),
                    requests: vec![PolicyRequest {
                        algorithm: None,
                        policy: RequestPolicy {
                            id: REWRAP_POLICY_ID.to_string(),
                            body: policy_b64.clone(),
                        },
                        key_access_objects: group
                            .indices
                            .iter()
                            .map(|&i| KeyAccessObjectWrapper {
                                key_access_object_id: kao_id(i),
                                key_access_object: key_access[i].clone(),
                            })
                            .collect(),
                    }],
                };
                let client = self.clone();
                let base_url = group.base_url.clone();
                let timeout = config.kas_timeout;
                debug!(kas_url = %group.origin, objects = group.indices.len(), "rewrap queued");
                tasks.spawn(async move {
                    let result = client.rewrap(&base_url, &request, timeout).await;
                    (group_index, result)
                });
            }

            let mut responses: Vec<(usize, Result<RewrapResponse, KasError>)> =
                Vec::with_capacity(groups.len());
            loop {
                tokio::select! {
                    biased;
                    _ = config.cancel.cancelled() => {
                        tasks.abort_all();
                        debug!("rewrap cancelled");
                        return Err(TdfError::Cancelled);
                    }
                    joined = tasks.join_next() => match joined {
                        Some(Ok(done)) => responses.push(done),
                        Some(Err(e)) => task_errors.push(format!("rewrap task failed: {e}")),
                        None => break,
                    }
                }
            }

            for (group_index, result) in responses {
                let Some(group) = groups.get(group_index) else {
                    continue;
                };
                let response = match result {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(kas_url = %group.origin, error = %e, "rewrap request failed");
                        for &index in &group.indices {
                            failures.push(Failure::new(index, e.to_string()));
                        }
                        continue;
                    }
                };
                let first = group.indices.first().map(|&i| kao_id(i)).unwrap_or_default();
                let response = response.upgrade_v1(REWRAP_POLICY_ID, &first);

                for &index in &group.indices {
                    let id = kao_id(index);
                    let Some(result) = response.results().find(|r| r.key_access_object_id == id)
                    else {
                        failures.push(Failure::new(index, "no result in rewrap response"));
                        continue;
                    };
                    if !result.is_permit() {
                        let denied = KasError::Denied {
                            kao_id: id,
                            reason: result
                                .error
                                .clone()
                                .unwrap_or_else(|| "access denied".to_string()),
                        };
                        failures.push(Failure::new(index, denied.to_string()));
                        continue;
                    }
                    match unwrap_result(&session, result, response.session_public_key.as_deref())
                    {
                        Ok(fragment) => {
                            let binding = &key_access[index].policy_binding;
                            if !verify_policy_binding(&fragment, policy_b64, binding)? {
                                warn!(kao_id = %id, "policy binding does not match the recovered key");
                                return Err(TdfError::Tampered(TamperKind::PolicyBinding));
                            }
                            unwrapped.push((index, fragment));
                        }
                        Err(e) => failures.push(Failure::new(index, e.to_string())),
                    }
                }
            }
        }
        unwrapped.sort_by_key(|(index, _)| *index);

        let mut fragments: Vec<&KeyFragment> = Vec::new();
        let mut missing: Vec<String> = Vec::new();
        for split in manifest.split_ids() {
            match unwrapped
                .iter()
                .find(|(index, _)| key_access[*index].split_id == split)
            {
                Some((_, fragment)) => fragments.push(fragment),
                None => missing.push(split.to_string()),
            }
        }

        if !missing.is_empty() {
            let relevant: Vec<&Failure> = failures
                .iter()
                .filter(|f| missing.contains(&key_access[f.index].split_id))
                .collect();
            if task_errors.is_empty()
                && !relevant.is_empty()
                && relevant.iter().all(|f| f.blocked)
            {
                let url = key_access[relevant[0].index].url.clone();
                return Err(TdfError::KasNotAllowed(url));
            }
            let reasons = relevant
                .iter()
                .map(|f| format!("{} ({}): {}", kao_id(f.index), key_access[f.index].url, f.reason))
                .chain(task_errors)
                .collect();
            return Err(TdfError::KasFailure(KasError::MissingSplits {
                splits: missing,
                reasons,
            }));
        }

        for failure in &failures {
            warn!(
                kao_id = %kao_id(failure.index),
                kas_url = %key_access[failure.index].url,
                reason = %failure.reason,
                "key access object failed; its split was recovered from another KAS"
            );
        }

        let metadata = unwrapped
            .iter()
            .rev()
            .find_map(|(index, fragment)| {
                key_access[*index]
                    .encrypted_metadata
                    .as_deref()
                    .map(|m| (m, fragment))
            })
            .map(|(encoded, fragment)| decrypt_metadata(fragment, encoded))
            .transpose()?;

        debug!(splits = fragments.len(), "DEK recovered");
        Ok(UnwrappedKey {
            dek: reconstruct_dek(fragments),
            metadata,
        })
    }
}
