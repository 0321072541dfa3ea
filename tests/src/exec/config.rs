//! Tunables and their validation.

use std::env;
use std::sync::Arc;

use dbt_core::BlockKey;
use dbt_exec::{ConfigError, ExecConfig, ExecEnv, SharedState, MAX_TBS, TB_HASH_BITS};

use super::{syscall, Machine};
use crate::guest::*;

fn out_of_range(config: ExecConfig) -> &'static str {
    match config.validate() {
        Err(ConfigError::OutOfRange { name, .. }) => name,
        other => panic!("expected out of range, got {other:?}"),
    }
}

#[test]
fn default_config_is_valid() {
    let c = ExecConfig::default();
    assert_eq!(c.validate(), Ok(()));
    assert_eq!(c.tb_capacity, MAX_TBS);
    assert_eq!(c.hash_bits, TB_HASH_BITS);
    assert!(c.chaining);
    assert!(!c.verify_cache);
}

#[test]
fn validate_rejects_out_of_range() {
    let d = ExecConfig::default;
    assert_eq!(out_of_range(ExecConfig { max_insns: 0, ..d() }), "max_insns");
    assert_eq!(out_of_range(ExecConfig { hash_bits: 25, ..d() }), "hash_bits");
    assert_eq!(out_of_range(ExecConfig { jmp_cache_bits: 0, ..d() }), "jmp_cache_bits");
    assert_eq!(out_of_range(ExecConfig { tb_capacity: 0, ..d() }), "tb_capacity");

    let err = ExecConfig { max_insns: 0, ..d() }.validate().unwrap_err();
    assert_eq!(err.to_string(), "max_insns must be in 1..=65535, got 0");
}

/// All environment handling lives in one test; the variables are
/// process wide.
#[test]
fn from_env_overrides_defaults() {
    env::set_var("DBT_MAX_INSNS", "32");
    env::set_var("DBT_HASH_BITS", " 10 ");
    env::set_var("DBT_NO_CHAIN", "1");
    env::set_var("DBT_VERIFY_CACHE", "");
    let c = ExecConfig::from_env().expect("valid environment");
    assert_eq!(c.max_insns, 32);
    assert_eq!(c.hash_bits, 10);
    assert!(!c.chaining);
    assert!(c.verify_cache);
    assert_eq!(c.tb_capacity, MAX_TBS);

    env::set_var("DBT_TB_CAPACITY", "lots");
    assert_eq!(
        ExecConfig::from_env(),
        Err(ConfigError::InvalidValue {
            name: "DBT_TB_CAPACITY",
            value: "lots".into(),
        })
    );
    env::remove_var("DBT_TB_CAPACITY");

    env::set_var("DBT_JMP_CACHE_BITS", "40");
    assert!(matches!(
        ExecConfig::from_env(),
        Err(ConfigError::OutOfRange {
            name: "jmp_cache_bits",
            got: 40,
            ..
        })
    ));

    for var in [
        "DBT_MAX_INSNS",
        "DBT_HASH_BITS",
        "DBT_NO_CHAIN",
        "DBT_VERIFY_CACHE",
        "DBT_JMP_CACHE_BITS",
    ] {
        env::remove_var(var);
    }
    assert_eq!(ExecConfig::from_env(), Ok(ExecConfig::default()));
}

#[test]
fn environment_rejects_bad_config() {
    let bad = ExecConfig {
        hash_bits: 0,
        ..ExecConfig::default()
    };
    let translator = Arc::new(ToyTranslator::new());
    let r =
        ExecEnv::<ToyCpu>::with_config(translator.clone(), toy_priority_table(), bad.clone());
    assert!(matches!(
        r.err(),
        Some(ConfigError::OutOfRange {
            name: "hash_bits",
            ..
        })
    ));
    assert!(SharedState::<ToyCpu>::new(translator, bad).is_err());
}

#[test]
fn max_insns_caps_unit_length() {
    let config = ExecConfig {
        max_insns: 2,
        ..ExecConfig::default()
    };
    let mut m = Machine::with_config(config, &[li(1, 1), li(2, 2), li(3, 3), sys(0)]);
    let e = syscall(m.run());
    assert_eq!(e.pc, 12);
    assert_eq!(m.cpu.regs[3], 3);
    assert_eq!(m.translator.translations(), 2);

    let tb = m
        .store()
        .lookup(&BlockKey::new(0, 0, 0), 2, 0)
        .expect("cached");
    assert_eq!(tb.icount, 2);
    assert_eq!(m.stats().links, 1);
}
