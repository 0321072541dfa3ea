//! Execution core tunables.

use std::env;
use std::str::FromStr;

use dbt_core::cflags::CF_COUNT_MASK;
use dbt_core::{TB_JMP_CACHE_BITS, TB_MAX_INSNS};

use crate::error::ConfigError;

/// Default log2 number of buckets in the global TB hash table.
pub const TB_HASH_BITS: u32 = 15;

/// Default cap on live translation units.
pub const MAX_TBS: usize = 65536;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecConfig {
    /// Instruction cap per unit.
    pub max_insns: u32,
    /// Live units allowed before a global flush.
    pub tb_capacity: usize,
    /// log2 of the hash table size.
    pub hash_bits: u32,
    /// log2 of the per-CPU jump cache size.
    pub jmp_cache_bits: u32,
    /// Link units through their `goto_tb` slots.
    pub chaining: bool,
    /// Check cache consistency after each translation.
    pub verify_cache: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_insns: TB_MAX_INSNS,
            tb_capacity: MAX_TBS,
            hash_bits: TB_HASH_BITS,
            jmp_cache_bits: TB_JMP_CACHE_BITS,
            chaining: true,
            verify_cache: false,
        }
    }
}

impl ExecConfig {
    /// Defaults overlaid with `DBT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = parse_env("DBT_MAX_INSNS")? {
            cfg.max_insns = v;
        }
        if let Some(v) = parse_env("DBT_TB_CAPACITY")? {
            cfg.tb_capacity = v;
        }
        if let Some(v) = parse_env("DBT_HASH_BITS")? {
            cfg.hash_bits = v;
        }
        if let Some(v) = parse_env("DBT_JMP_CACHE_BITS")? {
            cfg.jmp_cache_bits = v;
        }
        if env::var_os("DBT_NO_CHAIN").is_some() {
            cfg.chaining = false;
        }
        if env::var_os("DBT_VERIFY_CACHE").is_some() {
            cfg.verify_cache = true;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_insns", self.max_insns.into(), 1, CF_COUNT_MASK.into())?;
        check_range("tb_capacity", self.tb_capacity as u64, 1, u32::MAX.into())?;
        check_range("hash_bits", self.hash_bits.into(), 1, 24)?;
        check_range("jmp_cache_bits", self.jmp_cache_bits.into(), 1, 20)?;
        Ok(())
    }
}

fn check_range(name: &'static str, got: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&got) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            min,
            max,
            got,
        })
    }
}

fn parse_env<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}
