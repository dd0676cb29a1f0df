use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Embedded compliance rule document, replaced only out-of-band.
const BUILTIN_DOCUMENT: &str = include_str!("../rules/compliance.v1.json");

/// Upper bound for a single shipment, inclusive.
pub const MAX_WEIGHT_KG: f64 = 1_000_000.0;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RulesError {
    #[error("rule document parse error: {0}")]
    Parse(String),
    #[error("rule document validation error: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    Air,
    Sea,
    Road,
    Rail,
}

impl TransportMode {
    pub const ALL: [Self; 4] = [Self::Air, Self::Sea, Self::Road, Self::Rail];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Air => "air",
            Self::Sea => "sea",
            Self::Road => "road",
            Self::Rail => "rail",
        }
    }

    /// Case-insensitive parse of a transport mode name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "air" => Some(Self::Air),
            "sea" => Some(Self::Sea),
            "road" => Some(Self::Road),
            "rail" => Some(Self::Rail),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "kebab-case")]
pub enum CargoType {
    General,
    Hazmat,
    Perishable,
    TemperatureControlled,
}

impl CargoType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Hazmat => "hazmat",
            Self::Perishable => "perishable",
            Self::TemperatureControlled => "temperature-controlled",
        }
    }

    /// Case-insensitive parse of a cargo type name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "general" => Some(Self::General),
            "hazmat" => Some(Self::Hazmat),
            "perishable" => Some(Self::Perishable),
            "temperature-controlled" => Some(Self::TemperatureControlled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModeRestriction {
    pub allowed: bool,
    #[serde(default)]
    pub max_quantity_kg: Option<f64>,
    #[serde(default)]
    pub passenger_aircraft_allowed: Option<bool>,
    #[serde(default)]
    pub special_provisions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnCodeRule {
    pub name: String,
    pub hazard_class: String,
    pub packing_group: String,
    pub modes: BTreeMap<String, ModeRestriction>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionFactors {
    pub air: f64,
    pub sea: f64,
    pub road: f64,
    pub rail: f64,
}

impl EmissionFactors {
    /// kg CO2 per ton-kilometer for one transport mode.
    #[must_use]
    pub fn for_mode(&self, mode: TransportMode) -> f64 {
        match mode {
            TransportMode::Air => self.air,
            TransportMode::Sea => self.sea,
            TransportMode::Road => self.road,
            TransportMode::Rail => self.rail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Threshold {
    pub kg_co2: f64,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionThresholds {
    pub reporting: Threshold,
    pub offset: Threshold,
    pub air_modal_review: Threshold,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemperatureRange {
    pub min_c: f64,
    pub max_c: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerishableProfile {
    pub temperature_range: TemperatureRange,
    pub max_transit_days: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RouteRequirement {
    TransportModePresent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteCheck {
    pub id: String,
    pub description: String,
    pub requires: RouteRequirement,
}

/// Static, versioned compliance rule document. Loaded once per process and
/// immutable afterwards; a malformed document fails at load, never during
/// evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleSet {
    pub version: String,
    pub un_codes: BTreeMap<String, UnCodeRule>,
    pub emission_factors: EmissionFactors,
    pub emission_thresholds: EmissionThresholds,
    pub perishable_profiles: BTreeMap<String, PerishableProfile>,
    pub route_checks: Vec<RouteCheck>,
}

static BUILTIN: OnceLock<Result<RuleSet, RulesError>> = OnceLock::new();

impl RuleSet {
    /// Parse and validate a rule document from JSON text.
    ///
    /// # Errors
    /// Returns [`RulesError::Parse`] for malformed JSON and
    /// [`RulesError::Invalid`] when the document violates schema invariants.
    pub fn from_json(text: &str) -> Result<Self, RulesError> {
        let rules: Self =
            serde_json::from_str(text).map_err(|err| RulesError::Parse(err.to_string()))?;
        rules.validate()?;
        Ok(rules)
    }

    /// The embedded rule document, parsed and validated once per process.
    ///
    /// # Errors
    /// Returns [`RulesError`] when the embedded document is malformed; this
    /// indicates a packaging defect and fails every call identically.
    pub fn builtin() -> Result<&'static Self, RulesError> {
        BUILTIN.get_or_init(|| Self::from_json(BUILTIN_DOCUMENT)).as_ref().map_err(Clone::clone)
    }

    /// Check document invariants so lookups during evaluation cannot hit
    /// malformed entries.
    ///
    /// # Errors
    /// Returns [`RulesError::Invalid`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), RulesError> {
        if self.version.trim().is_empty() {
            return Err(RulesError::Invalid("version MUST be non-empty".to_string()));
        }

        for (mode, factor) in [
            ("air", self.emission_factors.air),
            ("sea", self.emission_factors.sea),
            ("road", self.emission_factors.road),
            ("rail", self.emission_factors.rail),
        ] {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(RulesError::Invalid(format!(
                    "emission factor for `{mode}` MUST be a positive number"
                )));
            }
        }

        for (name, threshold) in [
            ("reporting", &self.emission_thresholds.reporting),
            ("offset", &self.emission_thresholds.offset),
            ("air_modal_review", &self.emission_thresholds.air_modal_review),
        ] {
            if !threshold.kg_co2.is_finite() || threshold.kg_co2 <= 0.0 {
                return Err(RulesError::Invalid(format!(
                    "emission threshold `{name}` MUST be a positive number"
                )));
            }
        }

        for (code, rule) in &self.un_codes {
            if normalize_un_code(code).is_none() {
                return Err(RulesError::Invalid(format!(
                    "UN code key `{code}` MUST match UN followed by four digits"
                )));
            }
            if rule.name.trim().is_empty() {
                return Err(RulesError::Invalid(format!("UN code `{code}` MUST carry a name")));
            }
            for (mode, restriction) in &rule.modes {
                if TransportMode::parse(mode).is_none() {
                    return Err(RulesError::Invalid(format!(
                        "UN code `{code}` references unknown transport mode `{mode}`"
                    )));
                }
                if let Some(max) = restriction.max_quantity_kg {
                    if !max.is_finite() || max <= 0.0 {
                        return Err(RulesError::Invalid(format!(
                            "UN code `{code}` mode `{mode}` max_quantity_kg MUST be positive"
                        )));
                    }
                }
            }
        }

        for (category, profile) in &self.perishable_profiles {
            if profile.temperature_range.min_c >= profile.temperature_range.max_c {
                return Err(RulesError::Invalid(format!(
                    "perishable profile `{category}` temperature range MUST have min < max"
                )));
            }
            for (mode, days) in &profile.max_transit_days {
                if TransportMode::parse(mode).is_none() {
                    return Err(RulesError::Invalid(format!(
                        "perishable profile `{category}` references unknown transport mode `{mode}`"
                    )));
                }
                if *days == 0 {
                    return Err(RulesError::Invalid(format!(
                        "perishable profile `{category}` mode `{mode}` transit days MUST be >= 1"
                    )));
                }
            }
        }

        for check in &self.route_checks {
            if check.id.trim().is_empty() {
                return Err(RulesError::Invalid("route check id MUST be non-empty".to_string()));
            }
        }

        Ok(())
    }
}

/// Normalize a UN code to uppercase, returning `None` unless it matches
/// `UN` followed by exactly four digits.
#[must_use]
pub fn normalize_un_code(value: &str) -> Option<String> {
    let normalized = value.trim().to_ascii_uppercase();
    let digits = normalized.strip_prefix("UN")?;
    if digits.len() == 4 && digits.chars().all(|ch| ch.is_ascii_digit()) {
        Some(normalized)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    InvalidPayload,
    InvalidUnCode,
    InvalidTransportMode,
    InvalidCargoType,
    InvalidWeight,
    TransportModeForbidden,
    WeightLimitExceeded,
    PassengerAircraftRestriction,
    PerishableHandling,
    RouteCheckFailed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Issue {
    pub code: IssueCode,
    pub severity: IssueSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl Issue {
    fn error(code: IssueCode, message: String, recommendation: Option<String>) -> Self {
        Self { code, severity: IssueSeverity::Error, message, recommendation }
    }

    fn warning(code: IssueCode, message: String, recommendation: Option<String>) -> Self {
        Self { code, severity: IssueSeverity::Warning, message, recommendation }
    }
}

/// Shipment fields as supplied by the caller; parsed and range-checked
/// inside the evaluator so problems come back as issues, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShipmentInput {
    #[serde(default)]
    pub un_code: Option<String>,
    pub transport_mode: String,
    pub cargo_type: String,
    pub weight_kg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnCodeDetail {
    pub code: String,
    pub name: String,
    pub hazard_class: String,
    pub packing_group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerishableDetail {
    pub category: String,
    pub temperature_range: TemperatureRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transit_days_for_mode: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub un_code: Option<UnCodeDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perishable: Option<PerishableDetail>,
}

/// Output of one compliance evaluation. `is_valid` is false iff `issues` is
/// non-empty; warnings never affect validity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub issues: Vec<Issue>,
    pub warnings: Vec<Issue>,
    pub recommendations: Vec<String>,
    pub details: ValidationDetails,
}

fn weight_in_range(weight_kg: f64) -> bool {
    weight_kg.is_finite() && weight_kg > 0.0 && weight_kg <= MAX_WEIGHT_KG
}

/// Validate a shipment against the rule document.
///
/// Pure: the result is a function of the inputs and the loaded document
/// only. Independent structural violations are accumulated rather than
/// reported one per call; evaluation short-circuits only when the input
/// shape itself is unusable, and UN-code lookups are skipped when the code
/// failed format validation.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn evaluate_shipment(rules: &RuleSet, input: &ShipmentInput) -> ValidationResult {
    let mut issues: Vec<Issue> = Vec::new();
    let mut warnings: Vec<Issue> = Vec::new();
    let mut details = ValidationDetails::default();

    if input.transport_mode.trim().is_empty()
        || input.cargo_type.trim().is_empty()
        || !input.weight_kg.is_finite()
    {
        issues.push(Issue::error(
            IssueCode::InvalidPayload,
            "shipment payload is malformed: transport_mode, cargo_type and a numeric weight_kg are required"
                .to_string(),
            Some("resubmit the shipment with all required fields populated".to_string()),
        ));
        return ValidationResult {
            is_valid: false,
            issues,
            warnings,
            recommendations: Vec::new(),
            details,
        };
    }

    let normalized_code = match &input.un_code {
        None => None,
        Some(raw) => match normalize_un_code(raw) {
            Some(code) => Some(code),
            None => {
                issues.push(Issue::error(
                    IssueCode::InvalidUnCode,
                    format!("un_code `{raw}` must match `UN` followed by exactly four digits"),
                    Some("supply a code in the form UN1203".to_string()),
                ));
                None
            }
        },
    };

    let mode = TransportMode::parse(&input.transport_mode);
    if mode.is_none() {
        issues.push(Issue::error(
            IssueCode::InvalidTransportMode,
            format!(
                "transport_mode `{}` is not one of air, sea, road, rail",
                input.transport_mode.trim()
            ),
            None,
        ));
    }

    let cargo = CargoType::parse(&input.cargo_type);
    if cargo.is_none() {
        issues.push(Issue::error(
            IssueCode::InvalidCargoType,
            format!(
                "cargo_type `{}` is not one of general, hazmat, perishable, temperature-controlled",
                input.cargo_type.trim()
            ),
            None,
        ));
    }

    let weight_ok = weight_in_range(input.weight_kg);
    if !weight_ok {
        issues.push(Issue::error(
            IssueCode::InvalidWeight,
            format!(
                "weight_kg {} is outside the accepted range (0, {MAX_WEIGHT_KG}] kilograms",
                input.weight_kg
            ),
            None,
        ));
    }

    if cargo == Some(CargoType::Hazmat) {
        if let Some(code) = &normalized_code {
            match rules.un_codes.get(code) {
                None => {
                    issues.push(Issue::error(
                        IssueCode::InvalidUnCode,
                        format!("un_code `{code}` is not a known hazardous material code"),
                        Some("verify the UN number against the current dangerous goods list".to_string()),
                    ));
                }
                Some(rule) => {
                    details.un_code = Some(UnCodeDetail {
                        code: code.clone(),
                        name: rule.name.clone(),
                        hazard_class: rule.hazard_class.clone(),
                        packing_group: rule.packing_group.clone(),
                    });

                    if let Some(mode) = mode {
                        match rule.modes.get(mode.as_str()) {
                            Some(restriction) if restriction.allowed => {
                                if let Some(max) = restriction.max_quantity_kg {
                                    if weight_ok && input.weight_kg > max {
                                        issues.push(Issue::error(
                                            IssueCode::WeightLimitExceeded,
                                            format!(
                                                "{} kg of {} exceeds the {} kg limit for {} transport",
                                                input.weight_kg,
                                                rule.name,
                                                max,
                                                mode.as_str()
                                            ),
                                            Some("split the consignment or select another mode".to_string()),
                                        ));
                                    }
                                }
                                if mode == TransportMode::Air
                                    && restriction.passenger_aircraft_allowed == Some(false)
                                {
                                    warnings.push(Issue::warning(
                                        IssueCode::PassengerAircraftRestriction,
                                        format!(
                                            "{} ({code}) may not travel on passenger aircraft",
                                            rule.name
                                        ),
                                        Some("route via cargo aircraft".to_string()),
                                    ));
                                }
                            }
                            _ => {
                                issues.push(Issue::error(
                                    IssueCode::TransportModeForbidden,
                                    format!(
                                        "{} ({code}) may not be carried by {} transport",
                                        rule.name,
                                        mode.as_str()
                                    ),
                                    Some(format!("select a permitted mode for {}", rule.name)),
                                ));
                            }
                        }
                    }
                }
            }
        }
    }

    if matches!(cargo, Some(CargoType::Perishable | CargoType::TemperatureControlled)) {
        let category = cargo.map_or("", CargoType::as_str);
        if let Some(profile) = rules.perishable_profiles.get(category) {
            let transit_days =
                mode.and_then(|mode| profile.max_transit_days.get(mode.as_str()).copied());
            let transit_text = transit_days.map_or_else(String::new, |days| {
                format!(" and delivery within {days} days for the selected mode")
            });
            warnings.push(Issue::warning(
                IssueCode::PerishableHandling,
                format!(
                    "{category} cargo requires carriage between {}C and {}C{transit_text}",
                    profile.temperature_range.min_c, profile.temperature_range.max_c
                ),
                Some("confirm cold-chain equipment with the carrier before booking".to_string()),
            ));
            details.perishable = Some(PerishableDetail {
                category: category.to_string(),
                temperature_range: profile.temperature_range.clone(),
                max_transit_days_for_mode: transit_days,
            });
        }
    }

    // Structural route checks run last, even when redundant with the field
    // checks above.
    for check in &rules.route_checks {
        let passed = match check.requires {
            RouteRequirement::TransportModePresent => !input.transport_mode.trim().is_empty(),
        };
        if !passed {
            issues.push(Issue::error(
                IssueCode::RouteCheckFailed,
                format!("route check `{}` failed: {}", check.id, check.description),
                None,
            ));
        }
    }

    let mut recommendations: Vec<String> = Vec::new();
    if issues.is_empty() {
        if warnings.is_empty() {
            recommendations
                .push("Shipment passes all compliance checks. Proceed with booking.".to_string());
        } else {
            recommendations.push(
                "Shipment is compliant with warnings. Review special handling requirements before booking."
                    .to_string(),
            );
        }
    }

    ValidationResult { is_valid: issues.is_empty(), issues, warnings, recommendations, details }
}

/// Inputs for one emission calculation. When `distance_km` is absent a
/// deterministic placeholder estimate is derived from the origin and
/// destination strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionRequest {
    pub origin: String,
    pub destination: String,
    pub transport_mode: String,
    pub weight_kg: f64,
    #[serde(default)]
    pub distance_km: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionBreakdown {
    pub weight_kg: f64,
    pub distance_km: f64,
    pub mode: TransportMode,
    pub factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmissionReport {
    pub total_kg_co2: f64,
    pub breakdown: EmissionBreakdown,
    pub distance_estimated: bool,
    pub exceeds_reporting_threshold: bool,
    pub offset_recommended: bool,
    pub recommendations: Vec<String>,
}

/// Structured rejection for an emission request; returned as a value, never
/// raised, so callers can render it directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmissionRejection {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl EmissionRejection {
    fn new(error: &str, recommendation: &str) -> Self {
        Self { error: error.to_string(), recommendation: Some(recommendation.to_string()) }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Deterministic stand-in for a geocoding/distance service: an FNV-1a hash
/// of the normalized route name mapped into 500..=10000 km. Not accurate by
/// design; real routing stays outside this crate.
#[must_use]
pub fn estimate_distance_km(origin: &str, destination: &str) -> f64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x100_0000_01b3;

    let route = format!(
        "{}->{}",
        origin.trim().to_ascii_lowercase(),
        destination.trim().to_ascii_lowercase()
    );
    let mut acc = FNV_OFFSET;
    for byte in route.as_bytes() {
        acc ^= u64::from(*byte);
        acc = acc.wrapping_mul(FNV_PRIME);
    }

    let span = acc % 9_501;
    let km = 500 + span;
    #[allow(clippy::cast_precision_loss)]
    {
        km as f64
    }
}

/// Compute carbon emissions for a route and classify them against the
/// document thresholds. Pure; invalid input comes back as a rejection
/// value.
///
/// # Errors
/// Returns [`EmissionRejection`] for a blank origin or destination, an
/// unknown transport mode, an out-of-range weight, or a non-positive
/// supplied distance.
pub fn calculate_emissions(
    rules: &RuleSet,
    request: &EmissionRequest,
) -> Result<EmissionReport, EmissionRejection> {
    if request.origin.trim().is_empty() || request.destination.trim().is_empty() {
        return Err(EmissionRejection::new(
            "origin and destination are required",
            "supply both endpoints of the route",
        ));
    }

    let Some(mode) = TransportMode::parse(&request.transport_mode) else {
        return Err(EmissionRejection::new(
            "transport_mode must be one of air, sea, road, rail",
            "select a supported transport mode",
        ));
    };

    if !weight_in_range(request.weight_kg) {
        return Err(EmissionRejection::new(
            "weight_kg must be within (0, 1000000] kilograms",
            "check the shipment weight",
        ));
    }

    let (distance_km, distance_estimated) = match request.distance_km {
        Some(distance) if distance.is_finite() && distance > 0.0 => (distance, false),
        Some(_) => {
            return Err(EmissionRejection::new(
                "distance_km must be a positive number when supplied",
                "omit distance_km to fall back to the route estimate",
            ));
        }
        None => (estimate_distance_km(&request.origin, &request.destination), true),
    };

    let factor = rules.emission_factors.for_mode(mode);
    let ton_km = (request.weight_kg / 1000.0) * distance_km;
    let total_kg_co2 = round2(ton_km * factor);

    let thresholds = &rules.emission_thresholds;
    let exceeds_reporting_threshold = total_kg_co2 > thresholds.reporting.kg_co2;
    let offset_recommended = total_kg_co2 > thresholds.offset.kg_co2;

    let mut recommendations: Vec<String> = Vec::new();
    if exceeds_reporting_threshold {
        recommendations.push(format!(
            "Footprint of {total_kg_co2} kg CO2 exceeds the {} kg reporting threshold: file regulatory compliance reporting for this movement.",
            thresholds.reporting.kg_co2
        ));
    }
    if offset_recommended {
        recommendations.push(format!(
            "Purchase carbon offsets covering {total_kg_co2} kg CO2 for this movement."
        ));
    }
    if mode == TransportMode::Air && total_kg_co2 > thresholds.air_modal_review.kg_co2 {
        recommendations.push(
            "Air freight dominates this footprint: consider sea or rail for a large reduction."
                .to_string(),
        );
    }

    Ok(EmissionReport {
        total_kg_co2,
        breakdown: EmissionBreakdown {
            weight_kg: request.weight_kg,
            distance_km,
            mode,
            factor,
        },
        distance_estimated,
        exceeds_reporting_threshold,
        offset_recommended,
        recommendations,
    })
}
