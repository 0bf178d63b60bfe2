//! Minimal `KEY=VALUE`-per-line configuration loader, mirroring the
//! original engine's `commons` config library (`PUERTO_ESCUCHA`,
//! `ALGORITMO_PLANIFICACION`, `TIEMPO_AGING`, ...). Loading itself is
//! deliberately thin — no includes, no profiles — but the result is a
//! typed struct per role rather than stringly-typed lookups scattered
//! through the binaries.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use nom::{
    bytes::complete::{is_not, tag},
    character::complete::{char, multispace0},
    sequence::{separated_pair, terminated},
    IResult,
};
use thiserror::Error;

use crate::scheduler::state::Policy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Read(String, std::io::Error),
    #[error("missing required key {0}")]
    MissingKey(String),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

fn parse_line(input: &str) -> IResult<&str, (&str, &str)> {
    let key = is_not("=\n");
    let value = is_not("\n");
    terminated(separated_pair(key, char('='), value), multispace0)(input)
}

/// Parses `KEY=VALUE` lines, ignoring blank lines and `#`-comments.
pub fn parse_kv(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Ok((_, (k, v))) = parse_line(line) {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

pub fn load_kv<P: AsRef<Path>>(path: P) -> Result<HashMap<String, String>, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
    Ok(parse_kv(&contents))
}

fn get<'a>(map: &'a HashMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    map.get(key)
        .map(|s| s.as_str())
        .ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn get_int(map: &HashMap<String, String>, key: &str, default: i64) -> Result<i64, ConfigError> {
    match map.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), v.clone())),
    }
}

fn get_bool(map: &HashMap<String, String>, key: &str, default: bool) -> bool {
    match map.get(key).map(|s| s.to_ascii_uppercase()) {
        Some(v) => v == "TRUE" || v == "1",
        None => default,
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub listen_port: u16,
    pub policy: Policy,
    pub aging_interval_ms: u64,
    pub log_level: String,
}

impl SchedulerConfig {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let listen_port = get(map, "PUERTO_ESCUCHA")?
            .parse()
            .map_err(|_| ConfigError::InvalidValue("PUERTO_ESCUCHA".into(), get(map, "PUERTO_ESCUCHA")?.into()))?;
        let policy = match get(map, "ALGORITMO_PLANIFICACION").unwrap_or("FIFO") {
            "PRIORITY" => Policy::Priority,
            _ => Policy::Fifo,
        };
        let aging_interval_ms = get_int(map, "TIEMPO_AGING", 0)? as u64;
        let log_level = map.get("LOG_LEVEL").cloned().unwrap_or_else(|| "INFO".into());
        Ok(SchedulerConfig { listen_port, policy, aging_interval_ms, log_level })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementAlgorithm {
    Lru,
    ClockM,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub memory_size: usize,
    /// Expected frame size, checked against the storage handshake's
    /// authoritative value rather than used to size paged memory.
    pub block_size: usize,
    pub replacement_algorithm: ReplacementAlgorithm,
    pub storage_host: String,
    pub storage_port: u16,
    pub scheduler_host: String,
    pub scheduler_port: u16,
}

impl WorkerConfig {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let memory_size = get_int(map, "TAM_MEMORIA", 0)? as usize;
        let block_size = get_int(map, "BLOCK_SIZE_MOCK", 0)? as usize;
        let replacement_algorithm = match get(map, "ALGORITMO_REEMPLAZO").unwrap_or("CLOCK-M") {
            "LRU" => ReplacementAlgorithm::Lru,
            _ => ReplacementAlgorithm::ClockM,
        };
        Ok(WorkerConfig {
            memory_size,
            block_size,
            replacement_algorithm,
            storage_host: get(map, "IP_STORAGE")?.to_string(),
            storage_port: get(map, "PUERTO_STORAGE")?.parse().unwrap_or(0),
            scheduler_host: get(map, "IP_MASTER")?.to_string(),
            scheduler_port: get(map, "PUERTO_MASTER")?.parse().unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub listen_port: u16,
    pub mount_point: String,
    pub fs_size: u64,
    pub block_size: u32,
    pub fresh_start: bool,
    pub operation_delay_ms: u64,
    pub block_access_delay_ms: u64,
}

impl StorageConfig {
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Ok(StorageConfig {
            listen_port: get(map, "PUERTO_ESCUCHA")?.parse().unwrap_or(0),
            mount_point: get(map, "PUNTO_MONTAJE")?.to_string(),
            fs_size: get_int(map, "TAM_FS", 0)? as u64,
            block_size: get_int(map, "BLOCK_SIZE", 0)? as u32,
            fresh_start: get_bool(map, "FRESH_START", false),
            operation_delay_ms: get_int(map, "RETARDO_OPERACION", 0)? as u64,
            block_access_delay_ms: get_int(map, "RETARDO_ACCESO_BLOQUE", 0)? as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kv_ignoring_comments_and_blanks() {
        let text = "PUERTO_ESCUCHA=4444\n# a comment\n\nALGORITMO_PLANIFICACION=PRIORITY\n";
        let map = parse_kv(text);
        assert_eq!(map.get("PUERTO_ESCUCHA").unwrap(), "4444");
        assert_eq!(map.get("ALGORITMO_PLANIFICACION").unwrap(), "PRIORITY");
    }

    #[test]
    fn scheduler_config_defaults_fifo() {
        let map = parse_kv("PUERTO_ESCUCHA=5000\n");
        let cfg = SchedulerConfig::from_map(&map).unwrap();
        assert_eq!(cfg.policy, Policy::Fifo);
        assert_eq!(cfg.aging_interval_ms, 0);
    }
}
