//! Prepared plans: a named, portable operator tree plus the metadata
//! versions observed when it was built.

use std::io::{Read, Write};

use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::config::FeatureControls;
use crate::datastore::Datastore;
use crate::errors::{Error, Result};

use super::{resolve_version, MetadataRef, Operator};

/// Version counter observed for one keyspace or index at build time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataVersion {
    /// What the counter belongs to.
    #[serde(flatten)]
    pub target: MetadataRef,
    /// Observed version.
    pub version: u64,
}

/// A compiled, portable plan.
///
/// The encoded form is `base64(gzip(JSON(self)))`; decoding it must yield a
/// structurally equivalent plan. The name is either empty (anonymous) or
/// unique across the cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prepared {
    /// Statement name; empty for transient plans.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Original statement text.
    pub text: String,
    /// Statement type name ("SELECT", "UPDATE", …).
    #[serde(rename = "type")]
    pub stmt_type: String,
    /// Index API version the plan was built against.
    #[serde(rename = "indexApiVersion")]
    pub index_api_version: u32,
    /// Feature controls in effect at build time.
    #[serde(rename = "featureControls")]
    pub feature_controls: u64,
    /// Namespace the statement resolves in.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Query context path, when any.
    #[serde(rename = "queryContext", default, skip_serializing_if = "String::is_empty")]
    pub query_context: String,
    /// Whether execution cannot mutate documents.
    pub readonly: bool,
    /// The operator tree.
    pub operator: Operator,
    /// Metadata versions observed at build time.
    #[serde(
        rename = "metadataVersions",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub versions: Vec<MetadataVersion>,
    /// Cached encoded form; rebuilt on demand, never part of the encoding
    /// itself.
    #[serde(skip)]
    pub encoded_plan: String,
}

impl Prepared {
    /// Builds a prepared plan, recording current metadata versions.
    pub fn new(
        name: impl Into<String>,
        text: impl Into<String>,
        stmt_type: impl Into<String>,
        operator: Operator,
        index_api_version: u32,
        feature_controls: FeatureControls,
    ) -> Self {
        let readonly = operator.readonly();
        Self {
            name: name.into(),
            text: text.into(),
            stmt_type: stmt_type.into(),
            index_api_version,
            feature_controls: feature_controls.0,
            namespace: String::new(),
            query_context: String::new(),
            readonly,
            operator,
            versions: Vec::new(),
            encoded_plan: String::new(),
        }
    }

    /// Records the metadata versions currently visible in `datastore` for
    /// every reference in the plan.
    pub fn snapshot_versions(&mut self, datastore: &dyn Datastore) -> Result<()> {
        self.versions = self.current_versions(datastore)?;
        Ok(())
    }

    /// Computes the live version vector for this plan's references.
    pub fn current_versions(&self, datastore: &dyn Datastore) -> Result<Vec<MetadataVersion>> {
        let mut refs = Vec::new();
        self.operator.collect_refs(&mut refs);
        refs.into_iter()
            .map(|target| {
                let version = resolve_version(datastore, &target)?;
                Ok(MetadataVersion { target, version })
            })
            .collect()
    }

    /// Cheap staleness probe: compares a recorded version vector against
    /// the live datastore. Any resolution failure counts as a mismatch.
    pub fn metadata_check(
        &self,
        datastore: &dyn Datastore,
        recorded: &[MetadataVersion],
    ) -> bool {
        if recorded.is_empty() {
            return false;
        }
        recorded.iter().all(|mv| {
            resolve_version(datastore, &mv.target)
                .map(|live| live == mv.version)
                .unwrap_or(false)
        })
    }

    /// Expensive validity probe: re-resolves every keyspace and index.
    pub fn verify(&self, datastore: &dyn Datastore) -> bool {
        self.operator.verify(datastore)
    }

    /// Serialises, compresses, and encodes the plan, caching the result in
    /// [`Prepared::encoded_plan`].
    pub fn build_encoded_plan(&mut self) -> Result<()> {
        self.encoded_plan = self.encode()?;
        Ok(())
    }

    /// `base64(gzip(JSON(self)))`.
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).map_err(|e| Error::Internal {
            reason: format!("plan marshalling failed: {e}"),
        })?;
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&json).map_err(|e| Error::Internal {
            reason: format!("plan compression failed: {e}"),
        })?;
        let compressed = gz.finish().map_err(|e| Error::Internal {
            reason: format!("plan compression failed: {e}"),
        })?;
        Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
    }

    /// Reverses the base64 and gzip layers of an encoded plan, yielding the
    /// JSON document.
    pub fn decode_raw(encoded: &str) -> Result<Vec<u8>> {
        let compressed = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::PreparedDecoding {
                reason: format!("base64: {e}"),
            })?;
        let mut json = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| Error::PreparedDecoding {
                reason: format!("gzip: {e}"),
            })?;
        Ok(json)
    }

    /// Inverse of [`Prepared::encode`]. The decoded plan keeps the input
    /// string as its encoded form.
    pub fn decode(encoded: &str) -> Result<Prepared> {
        let json = Self::decode_raw(encoded)?;
        let mut prepared: Prepared =
            serde_json::from_slice(&json).map_err(|e| Error::PreparedDecoding {
                reason: format!("json: {e}"),
            })?;
        prepared.encoded_plan = encoded.to_owned();
        Ok(prepared)
    }

    /// Extracts the `text` field from a prepared JSON document that failed
    /// full unmarshalling, for reprepare-from-scratch recovery.
    pub fn text_of_raw(json: &[u8]) -> Option<String> {
        let raw: serde_json::Value = serde_json::from_slice(json).ok()?;
        raw.get("text")?.as_str().map(str::to_owned)
    }
}
