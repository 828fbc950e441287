//! # Save state archive
//!
//! An archive is a set of register files keyed by path (`vpu/vif1_1`, ...).
//! Each file maps register names to 32-bit or 128-bit values. The whole
//! archive is stored as one JSON document, 128-bit values as decimal strings
//! so nothing is lost on the way through JSON numbers.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("no state file {0} in archive")]
    MissingFile(String),
    #[error("no register {0} in state file")]
    MissingRegister(String),
}

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterStateFile {
    #[serde(default)]
    registers32: BTreeMap<String, u32>,
    #[serde(default)]
    #[serde_as(as = "BTreeMap<_, DisplayFromStr>")]
    registers128: BTreeMap<String, u128>,
}

impl RegisterStateFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register32(&mut self, name: &str, value: u32) {
        self.registers32.insert(name.to_owned(), value);
    }

    pub fn set_register128(&mut self, name: &str, value: u128) {
        self.registers128.insert(name.to_owned(), value);
    }

    pub fn register32(&self, name: &str) -> Result<u32> {
        self.registers32
            .get(name)
            .copied()
            .ok_or_else(|| StateError::MissingRegister(name.to_owned()))
    }

    pub fn register128(&self, name: &str) -> Result<u128> {
        self.registers128
            .get(name)
            .copied()
            .ok_or_else(|| StateError::MissingRegister(name.to_owned()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateArchive {
    files: BTreeMap<String, RegisterStateFile>,
}

impl StateArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: String, file: RegisterStateFile) {
        self.files.insert(path, file);
    }

    pub fn file(&self, path: &str) -> Result<&RegisterStateFile> {
        self.files
            .get(path)
            .ok_or_else(|| StateError::MissingFile(path.to_owned()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}
