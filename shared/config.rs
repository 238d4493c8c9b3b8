//! # Pipeline Configuration
//!
//! Every path, column name and tuning constant used by the stages lives in
//! `PipelineConfig`. The `Default` implementation reproduces the constants the
//! analysis was originally run with, so a stage invoked without a config file
//! behaves exactly like the historical batch scripts. A TOML file may override
//! any subset of sections; omitted sections keep their defaults.

use crate::analyze::runner::{ModelSequence, ModelStep};
use crate::codebook::Codebook;
use crate::reduce::BlockSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read configuration file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub columns: ColumnsConfig,
    pub extract: ExtractConfig,
    pub label: LabelConfig,
    pub codebook: Codebook,
    pub missing: MissingConfig,
    pub impute: ImputeConfig,
    pub reduce: ReduceConfig,
    pub models: ModelsConfig,
    pub forest: ForestConfig,
}

impl PipelineConfig {
    /// Loads the configuration from `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                log::info!("Loaded configuration from '{}'", path.display());
                toml::from_str(&text)?
            }
            None => {
                log::info!("No configuration file given; using built-in defaults.");
                Self::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let in_unit = |value: f64| (0.0..=1.0).contains(&value);
        if self.extract.chunk_size == 0 {
            return Err(ConfigError::Invalid("extract.chunk_size must be positive".into()));
        }
        if !in_unit(self.extract.escs_quantile) || !in_unit(self.label.score_quantile) {
            return Err(ConfigError::Invalid("quantiles must lie in [0, 1]".into()));
        }
        if self.impute.n_imputations == 0 {
            return Err(ConfigError::Invalid("impute.n_imputations must be positive".into()));
        }
        if self.impute.pmm_neighbors == 0 {
            return Err(ConfigError::Invalid("impute.pmm_neighbors must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.forest.test_fraction) || self.forest.test_fraction == 0.0 {
            return Err(ConfigError::Invalid("forest.test_fraction must lie in (0, 1)".into()));
        }
        if self.forest.n_trees == 0 {
            return Err(ConfigError::Invalid("forest.n_trees must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub sav: PathBuf,
    pub variable_labels: PathBuf,
    pub variable_info: PathBuf,
    pub extracted: PathBuf,
    pub labelled: PathBuf,
    pub cleaned: PathBuf,
    pub missing_table: PathBuf,
    pub missing_heatmap: PathBuf,
    pub imputed: PathBuf,
    pub icc_summary: PathBuf,
    pub psychological_components: PathBuf,
    pub environmental_components: PathBuf,
    pub pca_plots: PathBuf,
    pub model_results: PathBuf,
    pub feature_importance: PathBuf,
    pub feature_importance_plot: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let clean = Path::new("dataset/clean");
        let analysis = Path::new("dataset/analysis");
        Self {
            sav: PathBuf::from("dataset/meta/CY08MSP_STU_QQQ.SAV"),
            variable_labels: clean.join("STU_variables_explains.csv"),
            variable_info: clean.join("Variables_explanation.csv"),
            extracted: clean.join("STU_ESCS_below_country_25pct.csv"),
            labelled: clean.join("STU_ESCS_below_country_25pct_resilience.csv"),
            cleaned: clean.join("STU_includeVariablesSet.csv"),
            missing_table: analysis.join("missing_percentage_by_country.csv"),
            missing_heatmap: analysis.join("missing_data_heatmap_binary.png"),
            imputed: analysis.join("imputed_standardized_final.csv"),
            icc_summary: analysis.join("null_model_icc.csv"),
            psychological_components: analysis.join("pca_components_TUR_HKG.csv"),
            environmental_components: analysis.join("environmental_pca_components.csv"),
            pca_plots: analysis.join("pca_plots"),
            model_results: analysis.join("model_results"),
            feature_importance: analysis.join("feature_importance.csv"),
            feature_importance_plot: analysis.join("feature_importance_plot.png"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnsConfig {
    pub country: String,
    pub school: String,
    pub student: String,
    pub outcome: String,
    pub weight: String,
    pub imputation: String,
}

impl Default for ColumnsConfig {
    fn default() -> Self {
        Self {
            country: "CNT".to_string(),
            school: "CNTSCHID".to_string(),
            student: "CNTSTUID".to_string(),
            outcome: "ACADEMIC_RESILIENCE".to_string(),
            weight: "W_FSTUWT".to_string(),
            imputation: "imputation_num".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Records decoded and filtered per step of the streaming pass.
    pub chunk_size: usize,
    pub escs_column: String,
    pub escs_quantile: f64,
    /// Countries with fewer non-missing ESCS rows are dropped entirely.
    pub min_country_rows: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5_000,
            escs_column: "ESCS".to_string(),
            escs_quantile: 0.25,
            min_country_rows: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub score_columns: Vec<String>,
    pub score_quantile: f64,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            score_columns: (1..=10).map(|i| format!("PV{i}MATH")).collect(),
            score_quantile: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MissingConfig {
    /// Percentage at or above which a country/variable cell counts as highly missing.
    pub highly_missing_percent: f64,
    pub exclude_proportion: f64,
    pub good_proportion: f64,
}

impl Default for MissingConfig {
    fn default() -> Self {
        Self {
            highly_missing_percent: 50.0,
            exclude_proportion: 0.50,
            good_proportion: 0.20,
        }
    }
}

const STANDARDIZED_SCALES: [&str; 40] = [
    "BSMJ", "GROSAGR", "ANXMAT", "MATHEFF", "MATHEF21", "MATHPERS", "ASSERAGR", "COOPAGR",
    "CURIOAGR", "EMOCOAGR", "EMPATAGR", "PERSEVAGR", "STRESAGR", "CREATEFF", "CREATOP", "IMAGINE",
    "OPENART", "SDLEFF", "INFOSEEK", "EXPOFA", "EXPO21ST", "CREATAS", "CREATOOS", "TEACHSUP",
    "RELATST", "COGACRCO", "COGACMCO", "DISCLIM", "CREATSCH", "FAMSUP", "CREATFAM", "FAMSUPSL",
    "FEELLAH", "PROBSELF", "LEARRES", "BULLIED", "FEELSAFE", "SCHRISK", "BELONG", "SCHSUST",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputeConfig {
    pub n_imputations: usize,
    pub seed: u64,
    /// Donor pool size for predictive mean matching.
    pub pmm_neighbors: usize,
    pub highly_missing_percent: f64,
    /// A country is kept when the share of its highly missing variables is below this.
    pub good_country_proportion: f64,
    pub occupation_column: String,
    pub occupation_group_column: String,
    pub occupation_invalid_codes: Vec<f64>,
    pub drop_columns: Vec<String>,
    /// Complex scales without natural units; z-scored within each replicate.
    pub standardize: Vec<String>,
    /// Variables that also receive a `<name>_sch_mean` school-level mean.
    pub school_mean_variables: Vec<String>,
}

impl Default for ImputeConfig {
    fn default() -> Self {
        let standardize: Vec<String> = STANDARDIZED_SCALES.iter().map(|s| s.to_string()).collect();
        let mut school_mean_variables = standardize.clone();
        school_mean_variables.extend(
            ["AGE", "EXERPRAC", "STUDYHMW", "WORKPAY", "WORKHOME"]
                .iter()
                .map(|s| s.to_string()),
        );
        Self {
            n_imputations: 5,
            seed: 42,
            pmm_neighbors: 20,
            highly_missing_percent: 50.0,
            good_country_proportion: 0.10,
            occupation_column: "OCOD3".to_string(),
            occupation_group_column: "OCOD3_major_group".to_string(),
            occupation_invalid_codes: vec![9997.0, 9998.0, 9999.0],
            drop_columns: vec!["LANGN".to_string()],
            standardize,
            school_mean_variables,
        }
    }
}

fn block(name: &str, variables: &[&str]) -> BlockSpec {
    BlockSpec {
        name: name.to_string(),
        variables: variables.iter().map(|v| v.to_string()).collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceConfig {
    pub countries: Vec<String>,
    /// Kaiser criterion: components with a larger eigenvalue are retained.
    pub eigenvalue_threshold: f64,
    pub psychological_blocks: Vec<BlockSpec>,
    pub environmental_blocks: Vec<BlockSpec>,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            countries: vec!["TUR".to_string(), "HKG".to_string()],
            eigenvalue_threshold: 1.0,
            psychological_blocks: vec![
                block(
                    "Math_Disposition",
                    &[
                        "ANXMAT", "MATHEFF", "MATHEF21", "MATHPERS", "ST268Q04JA", "ST268Q07JA",
                        "ST268Q01JA",
                    ],
                ),
                block(
                    "Social_Emotional_Skills",
                    &["ASSERAGR", "COOPAGR", "EMOCOAGR", "EMPATAGR", "PERSEVAGR", "STRESAGR"],
                ),
                block(
                    "Openness_Creativity",
                    &["CURIOAGR", "CREATEFF", "CREATOP", "IMAGINE", "OPENART"],
                ),
                block("Self_Directed_Learning", &["SDLEFF", "GROSAGR"]),
            ],
            environmental_blocks: vec![
                block(
                    "Teacher_Classroom_Exp",
                    &["TEACHSUP", "RELATST", "COGACRCO", "COGACMCO", "DISCLIM", "CREATSCH"],
                ),
                block("Home_Learning_Env", &["FAMSUP", "CREATFAM", "FAMSUPSL"]),
                block("Remote_Learning_Exp", &["FEELLAH", "PROBSELF", "LEARRES"]),
                block(
                    "School_Experience",
                    &["BULLIED", "FEELSAFE", "SCHRISK", "BELONG", "SCHSUST"],
                ),
            ],
        }
    }
}

const CONTROLS: &str = "AGE + C(ST004D01T) + C(ISCEDP) + C(IMMIG) + C(CNT) + BSMJ + C(EXPECEDU) + C(SISCO) + C(OCOD3_major_group)";
const PRACTICE: &str = "C(REPEAT) + MISSSC + SKIPPING + TARDYSD + EXERPRAC + STUDYHMW + WORKPAY + WORKHOME + INFOSEEK + EXPOFA + EXPO21ST + CREATAS + CREATOOS";
const PSYCHOLOGY: [&str; 4] = [
    "Math_Disposition",
    "Social_Emotional_Skills",
    "Openness_Creativity",
    "Self_Directed_Learning",
];
const TEACHER_HOME_REMOTE: [&str; 3] =
    ["Teacher_Classroom_Exp", "Home_Learning_Env", "Remote_Learning_Exp"];

fn step(name: &str, terms: &[&str], components: &[&str]) -> ModelStep {
    ModelStep {
        name: name.to_string(),
        terms: terms.iter().map(|t| t.to_string()).collect(),
        components: components.iter().map(|c| c.to_string()).collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub countries: Vec<String>,
    /// Model A, fitted on every replicate and pooled with Rubin's Rules.
    pub pooled_formula: String,
    /// Nested sequences compared with likelihood-ratio tests.
    pub sequences: Vec<ModelSequence>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let environment: Vec<&str> = TEACHER_HOME_REMOTE
            .iter()
            .copied()
            .chain(["School_Experience"])
            .collect();
        let other_psychology = &PSYCHOLOGY[1..];
        Self {
            countries: vec!["TUR".to_string(), "HKG".to_string()],
            pooled_formula:
                "ACADEMIC_RESILIENCE ~ AGE + C(ST004D01T) + C(ISCEDP) + C(IMMIG) + C(CNT)"
                    .to_string(),
            sequences: vec![
                ModelSequence {
                    name: "main".to_string(),
                    steps: vec![
                        step("Controls", &[CONTROLS], &[]),
                        step("Psychology", &[], &PSYCHOLOGY),
                        step("Practice", &[PRACTICE], &[]),
                        step("TeacherHomeRemote", &[], &TEACHER_HOME_REMOTE),
                        step("SchoolExperience", &[], &["School_Experience"]),
                    ],
                },
                ModelSequence {
                    name: "environment_first".to_string(),
                    steps: vec![
                        step("Controls", &[CONTROLS], &[]),
                        step("Environment", &[], &environment),
                        step("Psychology", &[], &PSYCHOLOGY),
                    ],
                },
                ModelSequence {
                    name: "without_math_disposition".to_string(),
                    steps: vec![
                        step("Controls", &[CONTROLS], &[]),
                        step("OtherPsychology", &[], other_psychology),
                        step("Environment", &[], &environment),
                    ],
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub test_fraction: f64,
    pub seed: u64,
    pub min_samples_split: usize,
    /// Features tried per split; `None` means the square root of the feature count.
    pub max_features: Option<usize>,
    pub top_n_print: usize,
    pub top_n_plot: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            test_fraction: 0.3,
            seed: 42,
            min_samples_split: 2,
            max_features: None,
            top_n_print: 10,
            top_n_plot: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_toml_round_trip() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();
        let parsed: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.impute.n_imputations, 5);
        assert_eq!(parsed.models.sequences.len(), 3);
        assert_eq!(parsed.reduce.psychological_blocks[0].name, "Math_Disposition");
        assert_eq!(parsed.codebook, config.codebook);
    }

    #[test]
    fn partial_files_keep_other_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            [reduce]
            countries = ["FIN"]

            [forest]
            n_trees = 10
            "#,
        )
        .unwrap();
        assert_eq!(parsed.reduce.countries, vec!["FIN".to_string()]);
        assert_eq!(parsed.reduce.eigenvalue_threshold, 1.0);
        assert_eq!(parsed.forest.n_trees, 10);
        assert_eq!(parsed.forest.seed, 42);
        assert_eq!(parsed.extract.chunk_size, 5_000);
        parsed.validate().unwrap();
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = PipelineConfig::default();
        config.forest.test_fraction = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
