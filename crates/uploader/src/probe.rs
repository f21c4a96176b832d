use std::path::Path;

use crate::job::Rotation;
use crate::transcode::ToolError;

/// exiftool arguments that print the rotation tag of `src`
pub fn rotation_args(src: &Path) -> Vec<String> {
    vec!["-Rotation".to_string(), src.display().to_string()]
}

/// ffprobe arguments that print only the container duration of `src`
pub fn duration_args(src: &Path) -> Vec<String> {
    vec![
        "-v".to_string(),
        "quiet".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        src.display().to_string(),
    ]
}

/// Parse exiftool output of the form `Rotation : 90`
pub fn parse_rotation(output: &str) -> Result<Rotation, ToolError> {
    let parse_error = |message: String| ToolError::Parse {
        tool: "exiftool".to_string(),
        message,
    };

    let value = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "Rotation")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| parse_error("no rotation in output".to_string()))?;

    let degrees: i32 = value
        .parse()
        .map_err(|_| parse_error(format!("rotation {:?} is not a number", value)))?;

    Rotation::from_degrees(degrees)
        .ok_or_else(|| parse_error(format!("unsupported rotation of {} degrees", degrees)))
}

/// Parse ffprobe's bare duration output, in seconds
pub fn parse_duration(output: &str) -> Result<f64, ToolError> {
    let parse_error = |message: String| ToolError::Parse {
        tool: "ffprobe".to_string(),
        message,
    };

    let value = output
        .split_whitespace()
        .next()
        .ok_or_else(|| parse_error("empty output".to_string()))?;

    let duration: f64 = value
        .parse()
        .map_err(|_| parse_error(format!("duration {:?} is not a number", value)))?;

    if !duration.is_finite() || duration < 0.0 {
        return Err(parse_error(format!("invalid duration {}", duration)));
    }

    Ok(duration)
}
