//! Contract validation.
//!
//! Validates a version directory's `model.yaml` against the contract
//! schema and builds the immutable [`VersionDescriptor`]. Validation is
//! staged and never short-circuits on the first failure: all errors are
//! collected so a package author gets comprehensive feedback from one
//! run.
//!
//! Stages, in order:
//! 1. YAML parsing (must be a mapping)
//! 2. Required top-level field presence
//! 3. Directory/contract consistency and identifier formats
//! 4. Schema version support
//! 5. Typed parse of input/output/hardware/performance/limits sections
//! 6. Conditional requirements (batch/temporal sub-records)
//! 7. Required files (weights/, entry points)
//! 8. Forbidden content (script extensions, escaping symlinks)

use std::fs;
use std::path::Path;

use semver::Version;
use serde_yml::Value;
use tracing::warn;
use walkdir::WalkDir;

use crate::descriptor::{
    is_valid_model_id, is_valid_version, EntryPoints, HardwareSpec, InputFormat, InputKind,
    InputSpec, ModelCapabilities, OutputSpec, PerformanceHints, ResourceLimits, VersionDescriptor,
};
use crate::error::{ErrorCode, RuntimeError};

/// Name of the declarative contract file inside a version directory.
pub const CONTRACT_FILE_NAME: &str = "model.yaml";

/// Contract schema versions this runtime understands.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0.0"];

const REQUIRED_FIELDS: &[&str] = &[
    "model_id",
    "version",
    "display_name",
    "contract_schema_version",
    "input",
    "output",
    "hardware",
    "performance",
];

const REQUIRED_INPUT_FIELDS: &[&str] = &["type", "format", "min_width", "min_height", "channels"];
const REQUIRED_OUTPUT_FIELDS: &[&str] = &["schema_version", "schema"];
const REQUIRED_HARDWARE_FIELDS: &[&str] = &["supports_cpu", "supports_gpu", "supports_jetson"];
const REQUIRED_PERFORMANCE_FIELDS: &[&str] = &["inference_time_hint_ms", "recommended_fps"];

/// File extensions never allowed in a package outside `weights/`.
const FORBIDDEN_EXTENSIONS: &[&str] = &["sh", "bash", "exe", "dll", "dylib"];

/// Result of validating one version directory.
///
/// Collects every error and warning encountered; the descriptor is only
/// built when no errors were recorded.
#[derive(Debug)]
pub struct ValidationReport {
    pub model_id: String,
    pub version: String,
    pub errors: Vec<RuntimeError>,
    pub warnings: Vec<String>,
    pub descriptor: Option<VersionDescriptor>,
}

impl ValidationReport {
    fn new(model_id: &str, version: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            version: version.to_string(),
            errors: Vec::new(),
            warnings: Vec::new(),
            descriptor: None,
        }
    }

    /// True when validation recorded no errors.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, err: RuntimeError) {
        self.errors.push(
            err.with_model_id(self.model_id.clone())
                .with_version(self.version.clone()),
        );
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Validates `model.yaml` contracts and builds version descriptors.
#[derive(Debug, Default)]
pub struct ContractValidator;

impl ContractValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validate the contract in `version_path` against the identifiers
    /// taken from the directory names.
    #[must_use]
    pub fn validate(
        &self,
        version_path: &Path,
        expected_model_id: &str,
        expected_version: &str,
    ) -> ValidationReport {
        let mut report = ValidationReport::new(expected_model_id, expected_version);
        let contract_path = version_path.join(CONTRACT_FILE_NAME);

        // Stage 1: parse.
        let Some(contract) = self.parse_yaml(&contract_path, &mut report) else {
            return report;
        };

        // Stage 2: required top-level fields. Further stages are
        // pointless when the document skeleton is missing.
        if !self.check_required_fields(&contract, &contract_path, &mut report) {
            return report;
        }

        // Stage 3: directory/contract consistency.
        self.check_consistency(
            &contract,
            expected_model_id,
            expected_version,
            &contract_path,
            &mut report,
        );

        // Stage 4: schema version.
        let schema_version = str_field(&contract, "contract_schema_version").unwrap_or("1.0.0");
        if !SUPPORTED_SCHEMA_VERSIONS.contains(&schema_version) {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValUnsupportedSchemaVersion,
                    format!("unsupported contract schema version: {schema_version}"),
                )
                .with_path(contract_path.clone())
                .with_field("contract_schema_version")
                .with_expected(SUPPORTED_SCHEMA_VERSIONS.join(", "))
                .with_actual(schema_version),
            );
        }

        // Stage 5: typed section parses.
        let input = self.parse_input(&contract, &contract_path, &mut report);
        let output = self.parse_output(&contract, &contract_path, &mut report);
        let hardware = self.parse_hardware(&contract, &contract_path, &mut report);
        let performance = self.parse_performance(&contract, &contract_path, &mut report);
        let limits = self.parse_limits(&contract, &contract_path, &mut report);
        let capabilities = self.parse_capabilities(&contract);
        let entry_points = self.parse_entry_points(&contract);

        // Stage 6: conditional requirements.
        self.check_conditional(&contract, &input, &contract_path, &mut report);

        // Stage 7: required files.
        self.check_required_files(version_path, &entry_points, &mut report);

        // Stage 8: forbidden content.
        self.check_forbidden_content(version_path, &mut report);

        if report.is_valid() {
            let version_str = str_field(&contract, "version").unwrap_or(expected_version);
            match Version::parse(version_str) {
                Ok(version) => {
                    report.descriptor = Some(VersionDescriptor {
                        model_id: str_field(&contract, "model_id")
                            .unwrap_or(expected_model_id)
                            .to_string(),
                        version,
                        display_name: str_field(&contract, "display_name")
                            .unwrap_or(expected_model_id)
                            .to_string(),
                        description: str_field(&contract, "description")
                            .unwrap_or_default()
                            .to_string(),
                        author: str_field(&contract, "author").unwrap_or("unknown").to_string(),
                        contract_schema_version: schema_version.to_string(),
                        directory_path: version_path.to_path_buf(),
                        input,
                        output,
                        hardware,
                        performance,
                        limits,
                        capabilities,
                        entry_points,
                    });
                }
                Err(e) => {
                    report.error(
                        RuntimeError::new(
                            ErrorCode::DiscInvalidVersion,
                            format!("version '{version_str}' is not valid SemVer"),
                        )
                        .with_path(contract_path)
                        .with_field("version")
                        .with_cause(e),
                    );
                }
            }
        }

        report
    }

    fn parse_yaml(&self, contract_path: &Path, report: &mut ValidationReport) -> Option<Value> {
        if !contract_path.exists() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValContractNotFound,
                    format!("{CONTRACT_FILE_NAME} not found"),
                )
                .with_path(contract_path),
            );
            return None;
        }

        let raw = match fs::read_to_string(contract_path) {
            Ok(raw) => raw,
            Err(e) => {
                report.error(
                    RuntimeError::new(
                        ErrorCode::ValContractNotFound,
                        format!("{CONTRACT_FILE_NAME} could not be read"),
                    )
                    .with_path(contract_path)
                    .with_cause(e),
                );
                return None;
            }
        };

        match serde_yml::from_str::<Value>(&raw) {
            Ok(value) if value.is_mapping() => Some(value),
            Ok(_) => {
                report.error(
                    RuntimeError::new(
                        ErrorCode::ContractParseError,
                        format!("{CONTRACT_FILE_NAME} must contain a YAML mapping"),
                    )
                    .with_path(contract_path),
                );
                None
            }
            Err(e) => {
                report.error(
                    RuntimeError::new(ErrorCode::ValInvalidYaml, "invalid YAML syntax")
                        .with_path(contract_path)
                        .with_cause(e),
                );
                None
            }
        }
    }

    fn check_required_fields(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> bool {
        let mut complete = true;
        for field in REQUIRED_FIELDS {
            if contract.get(field).is_none() {
                complete = false;
                report.error(
                    RuntimeError::new(
                        ErrorCode::ValMissingRequiredField,
                        format!("required field '{field}' is missing"),
                    )
                    .with_path(contract_path)
                    .with_field(*field),
                );
            }
        }
        complete
    }

    fn check_consistency(
        &self,
        contract: &Value,
        expected_model_id: &str,
        expected_version: &str,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) {
        let actual_model_id = str_field(contract, "model_id").unwrap_or_default();
        let actual_version = str_field(contract, "version").unwrap_or_default();

        if actual_model_id != expected_model_id {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValModelIdMismatch,
                    "model_id in contract does not match directory name",
                )
                .with_path(contract_path)
                .with_field("model_id")
                .with_expected(expected_model_id)
                .with_actual(actual_model_id),
            );
        }

        if actual_version != expected_version {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValVersionMismatch,
                    "version in contract does not match directory name",
                )
                .with_path(contract_path)
                .with_field("version")
                .with_expected(expected_version)
                .with_actual(actual_version),
            );
        }

        if !is_valid_model_id(actual_model_id) {
            report.error(
                RuntimeError::new(
                    ErrorCode::DiscInvalidModelId,
                    format!("model_id '{actual_model_id}' does not match required pattern"),
                )
                .with_path(contract_path)
                .with_field("model_id")
                .with_expected("[a-z][a-z0-9_]{2,63}")
                .with_actual(actual_model_id),
            );
        }

        if !is_valid_version(actual_version) {
            report.error(
                RuntimeError::new(
                    ErrorCode::DiscInvalidVersion,
                    format!("version '{actual_version}' does not match SemVer pattern"),
                )
                .with_path(contract_path)
                .with_field("version")
                .with_expected("X.Y.Z or X.Y.Z-prerelease")
                .with_actual(actual_version),
            );
        }
    }

    fn parse_input(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> InputSpec {
        let section = contract.get("input").cloned().unwrap_or(Value::Null);
        require_nested(&section, "input", REQUIRED_INPUT_FIELDS, contract_path, report);

        let kind_str = str_field(&section, "type").unwrap_or("frame");
        let kind = match InputKind::parse(kind_str) {
            Some(kind) => kind,
            None => {
                report.error(
                    RuntimeError::new(
                        ErrorCode::ValInvalidInputType,
                        format!("invalid input type: {kind_str}"),
                    )
                    .with_path(contract_path)
                    .with_field("input.type")
                    .with_expected("frame, batch, or temporal")
                    .with_actual(kind_str),
                );
                InputKind::Frame
            }
        };

        let format_str = str_field(&section, "format").unwrap_or("jpeg");
        let format = match InputFormat::parse(format_str) {
            Some(format) => format,
            None => {
                report.warning(format!(
                    "unknown input format '{format_str}', defaulting to jpeg"
                ));
                InputFormat::Jpeg
            }
        };

        let batch = section.get("batch").cloned().unwrap_or(Value::Null);
        let temporal = section.get("temporal").cloned().unwrap_or(Value::Null);

        InputSpec {
            kind,
            format,
            min_width: u32_field(&section, "min_width", contract_path, report).unwrap_or(320),
            min_height: u32_field(&section, "min_height", contract_path, report).unwrap_or(240),
            max_width: u32_field(&section, "max_width", contract_path, report),
            max_height: u32_field(&section, "max_height", contract_path, report),
            channels: u32_field(&section, "channels", contract_path, report).unwrap_or(3),
            batch_min_size: u32_field(&batch, "min_size", contract_path, report),
            batch_max_size: u32_field(&batch, "max_size", contract_path, report),
            batch_recommended_size: u32_field(&batch, "recommended_size", contract_path, report),
            temporal_min_frames: u32_field(&temporal, "min_frames", contract_path, report),
            temporal_max_frames: u32_field(&temporal, "max_frames", contract_path, report),
            temporal_recommended_frames: u32_field(
                &temporal,
                "recommended_frames",
                contract_path,
                report,
            ),
            temporal_fps_requirement: temporal.get("fps_requirement").and_then(Value::as_f64),
        }
    }

    fn parse_output(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> OutputSpec {
        let section = contract.get("output").cloned().unwrap_or(Value::Null);
        require_nested(
            &section,
            "output",
            REQUIRED_OUTPUT_FIELDS,
            contract_path,
            report,
        );

        let schema = section.get("schema").cloned().unwrap_or(Value::Null);

        let event_type_enum = schema
            .get("event_type")
            .and_then(|et| et.get("enum"))
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| vec!["detected".to_string(), "not_detected".to_string()]);

        if event_type_enum.is_empty() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValInvalidOutputSchema,
                    "output.schema.event_type.enum must not be empty",
                )
                .with_path(contract_path)
                .with_field("output.schema.event_type.enum"),
            );
        }

        let metadata_allowed_keys = schema
            .get("metadata")
            .and_then(|m| m.get("allowed_keys"))
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        OutputSpec {
            schema_version: str_field(&section, "schema_version").unwrap_or("1.0").to_string(),
            event_type_enum,
            provides_bounding_boxes: schema.get("bounding_boxes").is_some(),
            provides_metadata: schema.get("metadata").is_some(),
            metadata_allowed_keys,
        }
    }

    fn parse_hardware(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> HardwareSpec {
        let section = contract.get("hardware").cloned().unwrap_or(Value::Null);
        require_nested(
            &section,
            "hardware",
            REQUIRED_HARDWARE_FIELDS,
            contract_path,
            report,
        );

        let hardware = HardwareSpec {
            supports_cpu: bool_field(&section, "supports_cpu", contract_path, report)
                .unwrap_or(true),
            supports_gpu: bool_field(&section, "supports_gpu", contract_path, report)
                .unwrap_or(false),
            supports_jetson: bool_field(&section, "supports_jetson", contract_path, report)
                .unwrap_or(false),
            min_gpu_memory_mb: u64_field(&section, "min_gpu_memory_mb", contract_path, report),
            min_cpu_cores: u32_field(&section, "min_cpu_cores", contract_path, report),
            min_ram_mb: u64_field(&section, "min_ram_mb", contract_path, report),
        };

        if !hardware.supports_cpu && !hardware.supports_gpu && !hardware.supports_jetson {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValHardwareIncompatible,
                    "contract supports no hardware target",
                )
                .with_path(contract_path)
                .with_field("hardware"),
            );
        }

        hardware
    }

    fn parse_performance(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> PerformanceHints {
        let section = contract.get("performance").cloned().unwrap_or(Value::Null);
        require_nested(
            &section,
            "performance",
            REQUIRED_PERFORMANCE_FIELDS,
            contract_path,
            report,
        );

        PerformanceHints {
            inference_time_hint_ms: u64_field(&section, "inference_time_hint_ms", contract_path, report)
                .unwrap_or(100),
            recommended_fps: u32_field(&section, "recommended_fps", contract_path, report)
                .unwrap_or(10),
            max_fps: u32_field(&section, "max_fps", contract_path, report),
            recommended_batch_size: u32_field(
                &section,
                "recommended_batch_size",
                contract_path,
                report,
            )
            .unwrap_or(1),
            warmup_iterations: u32_field(&section, "warmup_iterations", contract_path, report)
                .unwrap_or(1),
        }
    }

    fn parse_limits(
        &self,
        contract: &Value,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) -> ResourceLimits {
        let section = contract.get("limits").cloned().unwrap_or(Value::Null);
        let defaults = ResourceLimits::default();

        let limits = ResourceLimits {
            max_memory_mb: u64_field(&section, "max_memory_mb", contract_path, report),
            inference_timeout_ms: u64_field(&section, "inference_timeout_ms", contract_path, report)
                .unwrap_or(defaults.inference_timeout_ms),
            preprocessing_timeout_ms: u64_field(
                &section,
                "preprocessing_timeout_ms",
                contract_path,
                report,
            )
            .unwrap_or(defaults.preprocessing_timeout_ms),
            postprocessing_timeout_ms: u64_field(
                &section,
                "postprocessing_timeout_ms",
                contract_path,
                report,
            )
            .unwrap_or(defaults.postprocessing_timeout_ms),
            max_concurrent_inferences: u32_field(
                &section,
                "max_concurrent_inferences",
                contract_path,
                report,
            )
            .unwrap_or(defaults.max_concurrent_inferences),
        };

        for (field, value) in [
            ("limits.inference_timeout_ms", limits.inference_timeout_ms),
            ("limits.preprocessing_timeout_ms", limits.preprocessing_timeout_ms),
            ("limits.postprocessing_timeout_ms", limits.postprocessing_timeout_ms),
            (
                "limits.max_concurrent_inferences",
                u64::from(limits.max_concurrent_inferences),
            ),
        ] {
            if value == 0 {
                report.error(
                    RuntimeError::new(
                        ErrorCode::ValFieldOutOfRange,
                        format!("{field} must be greater than 0"),
                    )
                    .with_path(contract_path)
                    .with_field(field)
                    .with_actual("0"),
                );
            }
        }

        limits
    }

    fn parse_capabilities(&self, contract: &Value) -> ModelCapabilities {
        let section = contract.get("capabilities").cloned().unwrap_or(Value::Null);
        let flag = |name: &str| section.get(name).and_then(Value::as_bool).unwrap_or(false);
        ModelCapabilities {
            supports_batching: flag("supports_batching"),
            supports_async: flag("supports_async"),
            provides_tracking: flag("provides_tracking"),
            confidence_calibrated: flag("confidence_calibrated"),
            provides_bounding_boxes: flag("provides_bounding_boxes"),
            provides_keypoints: flag("provides_keypoints"),
        }
    }

    fn parse_entry_points(&self, contract: &Value) -> EntryPoints {
        let section = contract.get("entry_points").cloned().unwrap_or(Value::Null);
        let defaults = EntryPoints::default();
        EntryPoints {
            inference: str_field(&section, "inference")
                .map(str::to_string)
                .unwrap_or(defaults.inference),
            preprocess: str_field(&section, "preprocess").map(str::to_string),
            postprocess: str_field(&section, "postprocess").map(str::to_string),
            loader: str_field(&section, "loader").map(str::to_string),
        }
    }

    fn check_conditional(
        &self,
        contract: &Value,
        input: &InputSpec,
        contract_path: &Path,
        report: &mut ValidationReport,
    ) {
        let section = contract.get("input").cloned().unwrap_or(Value::Null);

        if input.kind == InputKind::Batch && section.get("batch").is_none() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ContractConditionalError,
                    "input.batch is required when input.type is 'batch'",
                )
                .with_path(contract_path)
                .with_field("input.batch"),
            );
        }

        if input.kind == InputKind::Temporal && section.get("temporal").is_none() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ContractConditionalError,
                    "input.temporal is required when input.type is 'temporal'",
                )
                .with_path(contract_path)
                .with_field("input.temporal"),
            );
        }
    }

    fn check_required_files(
        &self,
        version_path: &Path,
        entry_points: &EntryPoints,
        report: &mut ValidationReport,
    ) {
        let weights = version_path.join("weights");
        if !weights.exists() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValRequiredFileMissing,
                    "required directory 'weights/' not found",
                )
                .with_path(weights),
            );
        } else if !weights.is_dir() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValRequiredFileMissing,
                    "'weights' must be a directory",
                )
                .with_path(weights),
            );
        }

        let inference = version_path.join(&entry_points.inference);
        if !inference.exists() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValRequiredFileMissing,
                    format!("required file '{}' not found", entry_points.inference),
                )
                .with_path(inference),
            );
        }

        for (label, declared) in [
            ("preprocess", &entry_points.preprocess),
            ("postprocess", &entry_points.postprocess),
            ("loader", &entry_points.loader),
        ] {
            if let Some(name) = declared {
                let path = version_path.join(name);
                if !path.exists() {
                    report.error(
                        RuntimeError::new(
                            ErrorCode::ValRequiredFileMissing,
                            format!("declared {label} file '{name}' not found"),
                        )
                        .with_path(path),
                    );
                }
            }
        }
    }

    fn check_forbidden_content(&self, version_path: &Path, report: &mut ValidationReport) {
        let weights = version_path.join("weights");
        let canonical_root = version_path.canonicalize().ok();

        for entry in WalkDir::new(version_path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();

            if entry.file_type().is_file() && !path.starts_with(&weights) {
                let extension = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_lowercase);
                if let Some(extension) = extension {
                    if FORBIDDEN_EXTENSIONS.contains(&extension.as_str()) {
                        report.error(
                            RuntimeError::new(
                                ErrorCode::ValForbiddenContent,
                                format!(
                                    "forbidden file type detected: {}",
                                    entry.file_name().to_string_lossy()
                                ),
                            )
                            .with_path(path)
                            .with_actual(format!(".{extension}")),
                        );
                    }
                }
            }

            if entry.path_is_symlink() {
                match path.canonicalize() {
                    Ok(target) => {
                        let escapes = canonical_root
                            .as_ref()
                            .map(|root| !target.starts_with(root))
                            .unwrap_or(true);
                        if escapes {
                            report.error(
                                RuntimeError::new(
                                    ErrorCode::DiscForbiddenSymlink,
                                    format!(
                                        "symlink resolves outside the version directory: {} -> {}",
                                        path.display(),
                                        target.display()
                                    ),
                                )
                                .with_path(path),
                            );
                        }
                    }
                    Err(_) => {
                        warn!(path = %path.display(), "broken symlink in model package");
                        report.warning(format!("broken symlink detected: {}", path.display()));
                    }
                }
            }
        }
    }
}

// ============================================================================
// Typed field accessors
// ============================================================================

fn str_field<'a>(value: &'a Value, field: &str) -> Option<&'a str> {
    value.get(field).and_then(Value::as_str)
}

fn u64_field(
    value: &Value,
    field: &str,
    contract_path: &Path,
    report: &mut ValidationReport,
) -> Option<u64> {
    let raw = value.get(field)?;
    match raw.as_u64() {
        Some(n) => Some(n),
        None => {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValInvalidFieldType,
                    format!("field '{field}' must be a non-negative integer"),
                )
                .with_path(contract_path)
                .with_field(field)
                .with_expected("integer")
                .with_actual(type_name(raw)),
            );
            None
        }
    }
}

fn u32_field(
    value: &Value,
    field: &str,
    contract_path: &Path,
    report: &mut ValidationReport,
) -> Option<u32> {
    let n = u64_field(value, field, contract_path, report)?;
    match u32::try_from(n) {
        Ok(n) => Some(n),
        Err(_) => {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValFieldOutOfRange,
                    format!("field '{field}' is out of range"),
                )
                .with_path(contract_path)
                .with_field(field)
                .with_actual(n.to_string()),
            );
            None
        }
    }
}

fn bool_field(
    value: &Value,
    field: &str,
    contract_path: &Path,
    report: &mut ValidationReport,
) -> Option<bool> {
    let raw = value.get(field)?;
    match raw.as_bool() {
        Some(b) => Some(b),
        None => {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValInvalidFieldType,
                    format!("field '{field}' must be a boolean"),
                )
                .with_path(contract_path)
                .with_field(field)
                .with_expected("boolean")
                .with_actual(type_name(raw)),
            );
            None
        }
    }
}

fn require_nested(
    section: &Value,
    section_name: &str,
    fields: &[&str],
    contract_path: &Path,
    report: &mut ValidationReport,
) {
    for field in fields {
        if section.get(field).is_none() {
            report.error(
                RuntimeError::new(
                    ErrorCode::ValMissingRequiredField,
                    format!("required field '{section_name}.{field}' is missing"),
                )
                .with_path(contract_path)
                .with_field(format!("{section_name}.{field}")),
            );
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    const VALID_CONTRACT: &str = r#"
model_id: sample_det
version: 1.0.0
display_name: Sample Detector
contract_schema_version: 1.0.0
input:
  type: frame
  format: rgb8
  min_width: 320
  min_height: 240
  channels: 3
output:
  schema_version: "1.0"
  schema:
    event_type:
      enum: [detected, not_detected]
    metadata:
      allowed_keys: [confidence]
hardware:
  supports_cpu: true
  supports_gpu: false
  supports_jetson: false
performance:
  inference_time_hint_ms: 50
  recommended_fps: 10
limits:
  max_concurrent_inferences: 2
"#;

    fn write_package(dir: &Path, contract: &str) {
        fs::create_dir_all(dir.join("weights")).unwrap();
        fs::write(dir.join(CONTRACT_FILE_NAME), contract).unwrap();
        File::create(dir.join("weights/model.bin")).unwrap();
        File::create(dir.join("inference.wasm")).unwrap();
    }

    #[test]
    fn test_valid_contract() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), VALID_CONTRACT);

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report.is_valid(), "errors: {:?}", report.errors);

        let descriptor = report.descriptor.unwrap();
        assert_eq!(descriptor.model_id, "sample_det");
        assert_eq!(descriptor.version, Version::new(1, 0, 0));
        assert_eq!(descriptor.input.kind, InputKind::Frame);
        assert_eq!(descriptor.limits.max_concurrent_inferences, 2);
        assert_eq!(descriptor.limits.inference_timeout_ms, 5000);
        assert_eq!(
            descriptor.output.metadata_allowed_keys,
            vec!["confidence".to_string()]
        );
        assert!(descriptor.output.provides_metadata);
        assert!(!descriptor.output.provides_bounding_boxes);
    }

    #[test]
    fn test_missing_contract_file() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("weights")).unwrap();

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(!report.is_valid());
        assert_eq!(report.errors[0].code, ErrorCode::ValContractNotFound);
    }

    #[test]
    fn test_missing_required_fields_all_reported() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), "model_id: sample_det\nversion: 1.0.0\n");

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(!report.is_valid());
        let missing: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.code == ErrorCode::ValMissingRequiredField)
            .collect();
        // display_name, contract_schema_version, input, output, hardware, performance
        assert_eq!(missing.len(), 6);
    }

    #[test]
    fn test_directory_mismatch_is_error_never_adopted() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), VALID_CONTRACT);

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "2.0.0");
        assert!(!report.is_valid());
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValVersionMismatch));
        assert!(report.descriptor.is_none());
    }

    #[test]
    fn test_unsupported_schema_version() {
        let tmp = TempDir::new().unwrap();
        write_package(
            tmp.path(),
            &VALID_CONTRACT.replace("contract_schema_version: 1.0.0", "contract_schema_version: 9.0.0"),
        );

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValUnsupportedSchemaVersion));
    }

    #[test]
    fn test_batch_type_requires_batch_section() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), &VALID_CONTRACT.replace("type: frame", "type: batch"));

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ContractConditionalError));
    }

    #[test]
    fn test_missing_weights_and_entry_point() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONTRACT_FILE_NAME), VALID_CONTRACT).unwrap();

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        let missing: Vec<_> = report
            .errors
            .iter()
            .filter(|e| e.code == ErrorCode::ValRequiredFileMissing)
            .collect();
        assert_eq!(missing.len(), 2); // weights/ and inference.wasm
    }

    #[test]
    fn test_forbidden_script_extension() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), VALID_CONTRACT);
        fs::write(tmp.path().join("setup.sh"), "#!/bin/sh\n").unwrap();

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValForbiddenContent));
    }

    #[test]
    fn test_compiled_artifacts_allowed_inside_weights() {
        let tmp = TempDir::new().unwrap();
        write_package(tmp.path(), VALID_CONTRACT);
        fs::write(tmp.path().join("weights/kernel.dll"), b"bin").unwrap();

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escaping_version_dir() {
        let tmp = TempDir::new().unwrap();
        let package = tmp.path().join("pkg");
        fs::create_dir_all(&package).unwrap();
        write_package(&package, VALID_CONTRACT);

        let outside = tmp.path().join("outside.txt");
        fs::write(&outside, "data").unwrap();
        std::os::unix::fs::symlink(&outside, package.join("link.txt")).unwrap();

        let report = ContractValidator::new().validate(&package, "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::DiscForbiddenSymlink));
    }

    #[test]
    fn test_declared_optional_entry_point_must_exist() {
        let tmp = TempDir::new().unwrap();
        let contract = format!(
            "{VALID_CONTRACT}entry_points:\n  inference: inference.wasm\n  preprocess: preprocessing.wasm\n"
        );
        write_package(tmp.path(), &contract);

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValRequiredFileMissing));
    }

    #[test]
    fn test_wrong_field_type_reported() {
        let tmp = TempDir::new().unwrap();
        write_package(
            tmp.path(),
            &VALID_CONTRACT.replace("min_width: 320", "min_width: wide"),
        );

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValInvalidFieldType));
    }

    #[test]
    fn test_zero_limit_out_of_range() {
        let tmp = TempDir::new().unwrap();
        write_package(
            tmp.path(),
            &VALID_CONTRACT.replace("max_concurrent_inferences: 2", "max_concurrent_inferences: 0"),
        );

        let report = ContractValidator::new().validate(tmp.path(), "sample_det", "1.0.0");
        assert!(report
            .errors
            .iter()
            .any(|e| e.code == ErrorCode::ValFieldOutOfRange));
    }
}
