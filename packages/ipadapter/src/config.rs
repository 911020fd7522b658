// src/config.rs

use crate::error::Result;
use ipadapter_domain::ApplyParams;
use std::path::Path;

/// Parse and validate apply parameters from JSON. Missing fields take their
/// defaults.
pub fn parse_apply_params(json: &str) -> Result<ApplyParams> {
    let params: ApplyParams = serde_json::from_str(json)?;
    params.validate()?;
    Ok(params)
}

/// Read apply parameters from a JSON file.
pub fn load_apply_params<P: AsRef<Path>>(path: P) -> Result<ApplyParams> {
    let json = std::fs::read_to_string(path)?;
    parse_apply_params(&json)
}
