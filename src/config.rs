use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KiraError;
use crate::locator;
use crate::stage;

pub const REQUIRED_KEYS: [&str; 5] = [
    "heuristic",
    "epi_ap_phase_enc_dir",
    "orientation",
    "slice_order",
    "slice_direction",
];

const OPTIONAL_KEYS: [&str; 9] = [
    "studydir",
    "b1_after",
    "total_readout_time",
    "fieldmap_units",
    "b1_acq",
    "validator_image",
    "mriqc_image",
    "tool_timeouts",
    "use_docker",
];

/// Blocks that may live in their own `code/<name>.json` file instead of config.json.
pub const MODALITY_FILES: [&str; 1] = ["mp2rage"];

pub const DEFAULT_B1_AFTER: &str = "src2rawdata";
pub const DEFAULT_FIELDMAP_UNITS: &str = "rad/s";
pub const DEFAULT_B1_ACQ: &str = "dream";
pub const DEFAULT_VALIDATOR_IMAGE: &str = "bids/validator";
pub const DEFAULT_MRIQC_IMAGE: &str = "nipreps/mriqc:latest";

/// Phase-encoding axis token such as `j` or `j-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEncodingDirection {
    axis: char,
    negative: bool,
}

impl PhaseEncodingDirection {
    pub fn opposite(&self) -> Self {
        Self {
            axis: self.axis,
            negative: !self.negative,
        }
    }
}

impl fmt::Display for PhaseEncodingDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            write!(f, "{}-", self.axis)
        } else {
            write!(f, "{}", self.axis)
        }
    }
}

impl FromStr for PhaseEncodingDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut chars = value.trim().chars();
        let axis = chars.next();
        let rest: String = chars.collect();
        match (axis, rest.as_str()) {
            (Some(axis @ ('i' | 'j' | 'k')), "") => Ok(Self {
                axis,
                negative: false,
            }),
            (Some(axis @ ('i' | 'j' | 'k')), "-") => Ok(Self {
                axis,
                negative: true,
            }),
            _ => Err(format!(
                "expected one of i, j, k optionally followed by '-', got {value:?}"
            )),
        }
    }
}

/// Three-letter voxel orientation code, one letter per axis pair, naming the side
/// each voxel axis starts from (`LPI` runs left to right, posterior to anterior,
/// inferior to superior).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Orientation([char; 3]);

impl Orientation {
    pub fn from_letters(letters: [char; 3]) -> Result<Self, String> {
        let mut seen = [false; 3];
        for letter in letters {
            let axis = world_axis(letter).ok_or_else(|| {
                format!("unexpected letter {letter:?}, expected one of L R A P S I")
            })?;
            if seen[axis] {
                return Err(format!(
                    "{} uses the same axis twice",
                    letters.iter().collect::<String>()
                ));
            }
            seen[axis] = true;
        }
        Ok(Self(letters))
    }

    pub fn letters(&self) -> [char; 3] {
        self.0
    }

    /// Axis arguments for `fslswapdim`, e.g. `LR PA IS` for `LPI`.
    pub fn swap_args(&self) -> [&'static str; 3] {
        self.0.map(|letter| match letter {
            'L' => "LR",
            'R' => "RL",
            'A' => "AP",
            'P' => "PA",
            'S' => "SI",
            _ => "IS",
        })
    }

    pub fn flip_first(&self) -> Self {
        let [first, second, third] = self.0;
        Self([opposite_side(first), second, third])
    }
}

pub(crate) fn world_axis(letter: char) -> Option<usize> {
    match letter {
        'L' | 'R' => Some(0),
        'A' | 'P' => Some(1),
        'S' | 'I' => Some(2),
        _ => None,
    }
}

fn opposite_side(letter: char) -> char {
    match letter {
        'L' => 'R',
        'R' => 'L',
        'A' => 'P',
        'P' => 'A',
        'S' => 'I',
        _ => 'S',
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a}{b}{c}")
    }
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let letters: Vec<char> = value.trim().to_uppercase().chars().collect();
        match letters.as_slice() {
            [a, b, c] => Self::from_letters([*a, *b, *c]),
            _ => Err(format!("expected three letters, got {value:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SliceOrder {
    Up,
    Down,
    Odd,
    Even,
}

impl fmt::Display for SliceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SliceOrder::Up => write!(f, "up"),
            SliceOrder::Down => write!(f, "down"),
            SliceOrder::Odd => write!(f, "odd"),
            SliceOrder::Even => write!(f, "even"),
        }
    }
}

impl FromStr for SliceOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "up" => Ok(SliceOrder::Up),
            "down" => Ok(SliceOrder::Down),
            "odd" => Ok(SliceOrder::Odd),
            "even" => Ok(SliceOrder::Even),
            _ => Err(format!("expected up, down, odd or even, got {value:?}")),
        }
    }
}

/// Image axis the slices were acquired along (1 = x, 2 = y, 3 = z, 4 = t).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceDirection(u8);

impl SliceDirection {
    pub fn new(value: u64) -> Result<Self, String> {
        match u8::try_from(value) {
            Ok(axis @ 1..=4) => Ok(Self(axis)),
            _ => Err(format!("expected an integer between 1 and 4, got {value}")),
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for SliceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-invocation values that win over config.json.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub heuristic: Option<String>,
    pub epi_ap_phase_enc_dir: Option<String>,
    pub orientation: Option<String>,
    pub slice_order: Option<SliceOrder>,
    pub slice_direction: Option<u8>,
}

impl ConfigOverrides {
    fn apply(&self, map: &mut Map<String, Value>) {
        if let Some(value) = &self.heuristic {
            map.insert("heuristic".to_string(), Value::from(value.as_str()));
        }
        if let Some(value) = &self.epi_ap_phase_enc_dir {
            map.insert(
                "epi_ap_phase_enc_dir".to_string(),
                Value::from(value.as_str()),
            );
        }
        if let Some(value) = &self.orientation {
            map.insert("orientation".to_string(), Value::from(value.as_str()));
        }
        if let Some(value) = self.slice_order {
            map.insert("slice_order".to_string(), Value::from(value.to_string()));
        }
        if let Some(value) = self.slice_direction {
            map.insert("slice_direction".to_string(), Value::from(value));
        }
    }
}

#[derive(Debug, Clone)]
pub struct StudyConfig {
    pub root: Utf8PathBuf,
    pub config_path: Utf8PathBuf,
    pub heuristic: Utf8PathBuf,
    pub epi_ap_phase_enc_dir: PhaseEncodingDirection,
    pub orientation: Orientation,
    pub slice_order: SliceOrder,
    pub slice_direction: SliceDirection,
    pub b1_after: String,
    pub total_readout_time: Option<f64>,
    pub fieldmap_units: String,
    pub b1_acq: String,
    pub validator_image: String,
    pub mriqc_image: String,
    pub use_docker: bool,
    pub tool_timeouts: BTreeMap<String, u64>,
    /// Every key of config.json this crate does not interpret, untouched.
    pub extras: Map<String, Value>,
}

impl StudyConfig {
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn timeout_for(&self, stage: &str) -> Option<Duration> {
        self.tool_timeouts
            .get(stage)
            .map(|seconds| Duration::from_secs(*seconds))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(root: &Utf8Path, overrides: &ConfigOverrides) -> Result<StudyConfig, KiraError> {
        let config_path = locator::marker_path(root);
        let content =
            fs::read_to_string(config_path.as_std_path()).map_err(|err| KiraError::ConfigRead {
                path: config_path.clone(),
                message: err.to_string(),
            })?;
        let raw: Value = serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse {
            path: config_path.clone(),
            message: err.to_string(),
        })?;
        let mut config = resolve_config(root, &config_path, raw, overrides)?;
        load_modality_files(&mut config)?;
        Ok(config)
    }
}

pub fn resolve_config(
    root: &Utf8Path,
    config_path: &Utf8Path,
    raw: Value,
    overrides: &ConfigOverrides,
) -> Result<StudyConfig, KiraError> {
    let Value::Object(mut map) = raw else {
        return Err(KiraError::ConfigParse {
            path: config_path.to_path_buf(),
            message: "top-level value must be a JSON object".to_string(),
        });
    };
    overrides.apply(&mut map);

    let mut violations = Vec::new();
    let heuristic = required(&map, "heuristic", &mut violations, |value| {
        value
            .as_str()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(Utf8PathBuf::from)
            .ok_or_else(|| "expected a non-empty path string".to_string())
    });
    let phase_dir = required(&map, "epi_ap_phase_enc_dir", &mut violations, |value| {
        as_string(value)?.parse::<PhaseEncodingDirection>()
    });
    let orientation = required(&map, "orientation", &mut violations, |value| {
        as_string(value)?.parse::<Orientation>()
    });
    let slice_order = required(&map, "slice_order", &mut violations, |value| {
        as_string(value)?.parse::<SliceOrder>()
    });
    let slice_direction = required(&map, "slice_direction", &mut violations, |value| {
        value
            .as_u64()
            .ok_or_else(|| format!("expected an integer, got {value}"))
            .and_then(SliceDirection::new)
    });

    let studydir = optional(&map, "studydir", &mut violations, |value| {
        let path = Utf8PathBuf::from(as_string(value)?);
        if path.is_absolute() {
            Ok(path)
        } else {
            Err(format!("expected an absolute path, got {path}"))
        }
    });
    let b1_after = optional(&map, "b1_after", &mut violations, |value| {
        let name = as_string(value)?;
        if name != "b1" && stage::DEFAULT_ORDER.contains(&name) {
            Ok(name.to_string())
        } else {
            Err(format!("expected a pipeline stage name, got {name:?}"))
        }
    });
    let total_readout_time = optional(&map, "total_readout_time", &mut violations, |value| {
        value
            .as_f64()
            .filter(|seconds| *seconds > 0.0)
            .ok_or_else(|| format!("expected a positive number, got {value}"))
    });
    let fieldmap_units = optional(&map, "fieldmap_units", &mut violations, |value| {
        as_string(value).map(str::to_string)
    });
    let b1_acq = optional(&map, "b1_acq", &mut violations, |value| {
        let label = as_string(value)?;
        if !label.is_empty() && label.chars().all(|ch| ch.is_ascii_alphanumeric()) {
            Ok(label.to_string())
        } else {
            Err(format!("expected an alphanumeric label, got {label:?}"))
        }
    });
    let validator_image = optional(&map, "validator_image", &mut violations, |value| {
        as_string(value).map(str::to_string)
    });
    let mriqc_image = optional(&map, "mriqc_image", &mut violations, |value| {
        as_string(value).map(str::to_string)
    });
    let use_docker = optional(&map, "use_docker", &mut violations, |value| {
        value
            .as_bool()
            .ok_or_else(|| format!("expected true or false, got {value}"))
    });
    let tool_timeouts = optional(&map, "tool_timeouts", &mut violations, parse_timeouts);

    let (
        Some(heuristic),
        Some(epi_ap_phase_enc_dir),
        Some(orientation),
        Some(slice_order),
        Some(slice_direction),
    ) = (heuristic, phase_dir, orientation, slice_order, slice_direction)
    else {
        return Err(KiraError::ConfigValidation {
            path: config_path.to_path_buf(),
            violations,
        });
    };
    if !violations.is_empty() {
        return Err(KiraError::ConfigValidation {
            path: config_path.to_path_buf(),
            violations,
        });
    }

    let root = match studydir {
        Some(dir) if dir.is_dir() => dir,
        _ => root.to_path_buf(),
    };
    let heuristic = if heuristic.is_absolute() {
        heuristic
    } else {
        root.join(heuristic)
    };

    let extras = map
        .into_iter()
        .filter(|(key, _)| {
            !REQUIRED_KEYS.contains(&key.as_str()) && !OPTIONAL_KEYS.contains(&key.as_str())
        })
        .collect();

    Ok(StudyConfig {
        root,
        config_path: config_path.to_path_buf(),
        heuristic,
        epi_ap_phase_enc_dir,
        orientation,
        slice_order,
        slice_direction,
        b1_after: b1_after.unwrap_or_else(|| DEFAULT_B1_AFTER.to_string()),
        total_readout_time,
        fieldmap_units: fieldmap_units.unwrap_or_else(|| DEFAULT_FIELDMAP_UNITS.to_string()),
        b1_acq: b1_acq.unwrap_or_else(|| DEFAULT_B1_ACQ.to_string()),
        validator_image: validator_image.unwrap_or_else(|| DEFAULT_VALIDATOR_IMAGE.to_string()),
        mriqc_image: mriqc_image.unwrap_or_else(|| DEFAULT_MRIQC_IMAGE.to_string()),
        use_docker: use_docker.unwrap_or(false),
        tool_timeouts: tool_timeouts.unwrap_or_default(),
        extras,
    })
}

fn required<T>(
    map: &Map<String, Value>,
    key: &str,
    violations: &mut Vec<String>,
    parse: impl FnOnce(&Value) -> Result<T, String>,
) -> Option<T> {
    match map.get(key) {
        None | Some(Value::Null) => {
            violations.push(format!("missing required key `{key}`"));
            None
        }
        Some(value) => check(key, value, violations, parse),
    }
}

fn optional<T>(
    map: &Map<String, Value>,
    key: &str,
    violations: &mut Vec<String>,
    parse: impl FnOnce(&Value) -> Result<T, String>,
) -> Option<T> {
    match map.get(key) {
        None | Some(Value::Null) => None,
        Some(value) => check(key, value, violations, parse),
    }
}

fn check<T>(
    key: &str,
    value: &Value,
    violations: &mut Vec<String>,
    parse: impl FnOnce(&Value) -> Result<T, String>,
) -> Option<T> {
    match parse(value) {
        Ok(parsed) => Some(parsed),
        Err(message) => {
            violations.push(format!("`{key}`: {message}"));
            None
        }
    }
}

fn as_string(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("expected a string, got {value}"))
}

fn parse_timeouts(value: &Value) -> Result<BTreeMap<String, u64>, String> {
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected an object of stage -> seconds, got {value}"))?;
    let mut timeouts = BTreeMap::new();
    for (name, seconds) in object {
        if !stage::is_stage_name(name) {
            return Err(format!("unknown stage {name:?}"));
        }
        let seconds = seconds
            .as_u64()
            .filter(|seconds| *seconds > 0)
            .ok_or_else(|| format!("{name}: expected a positive number of seconds"))?;
        timeouts.insert(name.clone(), seconds);
    }
    Ok(timeouts)
}

fn load_modality_files(config: &mut StudyConfig) -> Result<(), KiraError> {
    let Some(code_dir) = config.config_path.parent().map(Utf8Path::to_path_buf) else {
        return Ok(());
    };
    for name in MODALITY_FILES {
        if config.extras.contains_key(name) {
            continue;
        }
        let path = code_dir.join(format!("{name}.json"));
        if !path.as_std_path().is_file() {
            continue;
        }
        let content =
            fs::read_to_string(path.as_std_path()).map_err(|err| KiraError::ConfigRead {
                path: path.clone(),
                message: err.to_string(),
            })?;
        let value: Value = serde_json::from_str(&content).map_err(|err| KiraError::ConfigParse {
            path: path.clone(),
            message: err.to_string(),
        })?;
        if !value.is_object() {
            return Err(KiraError::ConfigParse {
                path,
                message: "top-level value must be a JSON object".to_string(),
            });
        }
        tracing::debug!("loaded {name} metadata from {path}");
        config.extras.insert(name.to_string(), value);
    }
    Ok(())
}
