use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use freightlog_core::{
    append_decision, fetch_chain, verify_chain_detailed, AppendRequest, ChainVerification,
    DecisionRecord, KeyValueStore, CHAIN_KEY_PREFIX,
};
use freightlog_rules::{
    calculate_emissions, evaluate_shipment, EmissionRejection, EmissionReport, EmissionRequest,
    RuleSet, ShipmentInput, ValidationResult,
};
use freightlog_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainVerifyResult {
    pub subject_id: String,
    pub chain_length: usize,
    pub verification: ChainVerification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyAllResult {
    pub subjects_checked: usize,
    pub all_valid: bool,
    pub results: Vec<ChainVerifyResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceCheckRequest {
    pub subject_id: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub shipment: ShipmentInput,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComplianceCheckOutcome {
    pub result: ValidationResult,
    pub record: DecisionRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionCheckRequest {
    pub subject_id: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub request: EmissionRequest,
}

/// Emission evaluations always produce a value: either a report or a
/// structured rejection. Both are audited.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EmissionEvaluation {
    Calculated { report: EmissionReport },
    Rejected { rejection: EmissionRejection },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionCheckOutcome {
    pub evaluation: EmissionEvaluation,
    pub record: DecisionRecord,
}

/// Facade over the rules engine and the SQLite-backed audit store. Each call
/// opens the database and migrates it to the latest schema before operating.
#[derive(Debug, Clone)]
pub struct FreightLogApi {
    db_path: PathBuf,
}

impl FreightLogApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Append one decision record to a subject's audit chain.
    ///
    /// # Errors
    /// Returns an error when the request is invalid or persistence fails.
    pub fn record_decision(&self, request: AppendRequest) -> Result<DecisionRecord> {
        let mut store = self.open_migrated_store()?;
        let record = append_decision(&mut store, request)?;
        Ok(record)
    }

    /// Load a subject's full audit chain in append order.
    ///
    /// # Errors
    /// Returns an error when the stored chain cannot be read or decoded.
    pub fn chain_show(&self, subject_id: &str) -> Result<Vec<DecisionRecord>> {
        let store = self.open_migrated_store()?;
        let chain = fetch_chain(&store, subject_id)?;
        Ok(chain)
    }

    /// Verify one subject's chain and report the first fault, if any.
    ///
    /// # Errors
    /// Returns an error when the stored chain cannot be read or decoded.
    pub fn chain_verify(&self, subject_id: &str) -> Result<ChainVerifyResult> {
        let store = self.open_migrated_store()?;
        let chain = fetch_chain(&store, subject_id)?;
        Ok(ChainVerifyResult {
            subject_id: subject_id.to_string(),
            chain_length: chain.len(),
            verification: verify_chain_detailed(&chain),
        })
    }

    /// Verify every stored chain, sorted by subject.
    ///
    /// # Errors
    /// Returns an error when any stored chain cannot be read or decoded.
    pub fn chain_verify_all(&self) -> Result<VerifyAllResult> {
        let store = self.open_migrated_store()?;
        let entries = store
            .query_by_prefix(CHAIN_KEY_PREFIX)
            .map_err(|err| anyhow!("failed to list stored chains: {err}"))?;

        let mut results = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let subject_id = subject_id_from_chain_key(&key)
                .ok_or_else(|| anyhow!("unexpected chain key shape: {key}"))?;
            let chain: Vec<DecisionRecord> = serde_json::from_value(value)
                .with_context(|| format!("failed to decode stored chain under key `{key}`"))?;
            results.push(ChainVerifyResult {
                subject_id: subject_id.to_string(),
                chain_length: chain.len(),
                verification: verify_chain_detailed(&chain),
            });
        }

        Ok(VerifyAllResult {
            subjects_checked: results.len(),
            all_valid: results.iter().all(|result| result.verification.valid),
            results,
        })
    }

    /// Evaluate a shipment against the compliance rules and append the
    /// outcome to the subject's audit chain.
    ///
    /// # Errors
    /// Returns an error when the rule document cannot be loaded or the audit
    /// append fails. Rule violations are reported inside the result, not as
    /// errors.
    pub fn compliance_check(&self, input: ComplianceCheckRequest) -> Result<ComplianceCheckOutcome> {
        let rules = RuleSet::builtin()?;
        let result = evaluate_shipment(rules, &input.shipment);

        let mut store = self.open_migrated_store()?;
        let payload = serde_json::json!({
            "shipment": input.shipment,
            "result": result,
            "rules_version": rules.version,
        });
        let record = append_decision(
            &mut store,
            AppendRequest {
                subject_id: input.subject_id,
                action: "compliance_check".to_string(),
                actor_id: input.actor_id,
                payload,
                timestamp_ms: None,
            },
        )?;

        Ok(ComplianceCheckOutcome { result, record })
    }

    /// Calculate emissions for a route and append the outcome to the
    /// subject's audit chain.
    ///
    /// # Errors
    /// Returns an error when the rule document cannot be loaded or the audit
    /// append fails. Invalid emission inputs are reported as a rejected
    /// evaluation, not as errors.
    pub fn emission_check(&self, input: EmissionCheckRequest) -> Result<EmissionCheckOutcome> {
        let rules = RuleSet::builtin()?;
        let evaluation = match calculate_emissions(rules, &input.request) {
            Ok(report) => EmissionEvaluation::Calculated { report },
            Err(rejection) => EmissionEvaluation::Rejected { rejection },
        };

        let mut store = self.open_migrated_store()?;
        let payload = serde_json::json!({
            "request": input.request,
            "evaluation": evaluation,
            "rules_version": rules.version,
        });
        let record = append_decision(
            &mut store,
            AppendRequest {
                subject_id: input.subject_id,
                action: "emission_check".to_string(),
                actor_id: input.actor_id,
                payload,
                timestamp_ms: None,
            },
        )?;

        Ok(EmissionCheckOutcome { evaluation, record })
    }
}

fn subject_id_from_chain_key(key: &str) -> Option<&str> {
    key.strip_prefix(CHAIN_KEY_PREFIX)?.strip_suffix("-chain")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("freightlog-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn shipment(un_code: Option<&str>, mode: &str, cargo: &str, weight_kg: f64) -> ShipmentInput {
        ShipmentInput {
            un_code: un_code.map(ToString::to_string),
            transport_mode: mode.to_string(),
            cargo_type: cargo.to_string(),
            weight_kg,
        }
    }

    #[test]
    fn api_append_show_and_verify_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        for action in ["created", "booked"] {
            api.record_decision(AppendRequest {
                subject_id: "SHIP-100".to_string(),
                action: action.to_string(),
                actor_id: Some("ops".to_string()),
                payload: json!({"action": action}),
                timestamp_ms: None,
            })?;
        }

        let chain = api.chain_show("SHIP-100")?;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].action, "created");
        assert_eq!(chain[1].previous_hash, chain[0].hash);

        let verified = api.chain_verify("SHIP-100")?;
        assert!(verified.verification.valid);
        assert_eq!(verified.chain_length, 2);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_chain_show_for_unknown_subject_is_empty() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        assert!(api.chain_show("SHIP-NONE")?.is_empty());
        let verified = api.chain_verify("SHIP-NONE")?;
        assert!(verified.verification.valid);
        assert_eq!(verified.chain_length, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_compliance_check_audits_the_result() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        let outcome = api.compliance_check(ComplianceCheckRequest {
            subject_id: "SHIP-200".to_string(),
            actor_id: Some("compliance-bot".to_string()),
            shipment: shipment(Some("UN1203"), "air", "hazmat", 50.0),
        })?;

        assert!(outcome.result.is_valid);
        assert_eq!(outcome.record.action, "compliance_check");
        assert_eq!(outcome.record.actor_id, "compliance-bot");

        let chain = api.chain_show("SHIP-200")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].payload["result"]["is_valid"], json!(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_failed_compliance_check_is_still_audited() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        let outcome = api.compliance_check(ComplianceCheckRequest {
            subject_id: "SHIP-201".to_string(),
            actor_id: None,
            shipment: shipment(Some("UN0081"), "air", "hazmat", 50.0),
        })?;

        assert!(!outcome.result.is_valid);
        let chain = api.chain_show("SHIP-201")?;
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].payload["result"]["is_valid"], json!(false));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_emission_check_audits_report_and_rejection() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        let calculated = api.emission_check(EmissionCheckRequest {
            subject_id: "SHIP-300".to_string(),
            actor_id: None,
            request: EmissionRequest {
                origin: "Rotterdam".to_string(),
                destination: "Singapore".to_string(),
                transport_mode: "air".to_string(),
                weight_kg: 5000.0,
                distance_km: Some(10_000.0),
            },
        })?;
        match &calculated.evaluation {
            EmissionEvaluation::Calculated { report } => {
                assert!((report.total_kg_co2 - 25_000.0).abs() < f64::EPSILON);
            }
            EmissionEvaluation::Rejected { rejection } => {
                panic!("expected a report, got rejection: {}", rejection.error)
            }
        }

        let rejected = api.emission_check(EmissionCheckRequest {
            subject_id: "SHIP-300".to_string(),
            actor_id: None,
            request: EmissionRequest {
                origin: "Rotterdam".to_string(),
                destination: "Singapore".to_string(),
                transport_mode: "rocket".to_string(),
                weight_kg: 5000.0,
                distance_km: None,
            },
        })?;
        assert!(matches!(rejected.evaluation, EmissionEvaluation::Rejected { .. }));

        let chain = api.chain_show("SHIP-300")?;
        assert_eq!(chain.len(), 2);
        let verified = api.chain_verify("SHIP-300")?;
        assert!(verified.verification.valid);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn api_verify_all_covers_every_subject() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = FreightLogApi::new(db_path.clone());

        for subject_id in ["SHIP-A", "SHIP-B"] {
            api.record_decision(AppendRequest {
                subject_id: subject_id.to_string(),
                action: "created".to_string(),
                actor_id: None,
                payload: json!({}),
                timestamp_ms: None,
            })?;
        }

        let result = api.chain_verify_all()?;
        assert_eq!(result.subjects_checked, 2);
        assert!(result.all_valid);
        let subjects: Vec<&str> =
            result.results.iter().map(|entry| entry.subject_id.as_str()).collect();
        assert_eq!(subjects, vec!["SHIP-A", "SHIP-B"]);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
