use std::{cmp, str::FromStr, sync::LazyLock};

use crate::compiler::ops::RegClass;

#[derive(Debug, Clone, PartialEq)]
pub struct OptoConfig {
    pub verbosity: u8,

    pub allow_cisc_spill: bool,
    pub pressure_aware_scheduling: bool,
    pub coalesce: bool,
    pub int_regs: u8,
    pub float_regs: u8,
    pub max_spill_rounds: u32,
    pub verify: u8, // 0 = off, 1 = registers, 2 = + pressure after code motion, 3 = + pressure after every move
    pub error_as_deopt: bool,

    pub trace_cisc_spill: bool,
    pub trace_spilling: bool,

    pub use_perf_data: bool,
}

impl Default for OptoConfig {
    fn default() -> Self {
        OptoConfig {
            verbosity: 0,
            allow_cisc_spill: true,
            pressure_aware_scheduling: true,
            coalesce: true,
            int_regs: 14,
            float_regs: 16,
            max_spill_rounds: 16,
            verify: if cfg!(debug_assertions) { 2 } else { 0 },
            error_as_deopt: true,
            trace_cisc_spill: false,
            trace_spilling: false,
            use_perf_data: true,
        }
    }
}

impl OptoConfig {
    #[inline]
    pub fn verbosity(&self) -> u8 {
        if cfg!(debug_assertions) {
            self.verbosity
        } else {
            cmp::min(16, self.verbosity)
        }
    }

    #[inline]
    pub fn should_log(&self, level: u8) -> bool {
        self.verbosity() >= level
    }

    pub fn reg_limit(&self, class: RegClass) -> u32 {
        match class {
            RegClass::Int => self.int_regs as u32,
            RegClass::Float => self.float_regs as u32,
        }
    }

    pub fn reg_limits(&self) -> [u32; RegClass::COUNT] {
        RegClass::ALL.map(|c| self.reg_limit(c))
    }
}

fn parse_env_opt<T>(key: &str) -> Option<T>
where
    T: FromStr + 'static, <T as FromStr>::Err: std::fmt::Display
{
    if let Ok(mut val) = std::env::var(key) {
        if std::any::TypeId::of::<T>() == std::any::TypeId::of::<bool>() {
            val = val.to_lowercase();
            if val == "1" || val == "yes" {
                val = "true".to_string();
            } else if val == "0" || val == "no" {
                val = "false".to_string();
            }
        }
        match val.parse::<T>() {
            Ok(v) => Some(v),
            Err(err) => {
                if !val.is_empty() {
                    log::warn!("Ignoring env var {key}={val}: {err}");
                }
                None
            }
        }
    } else {
        None
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr + 'static, <T as FromStr>::Err: std::fmt::Display
{
    parse_env_opt(key).unwrap_or(default)
}

fn create_config() -> OptoConfig {
    let d = OptoConfig::default();
    let c = OptoConfig {
        verbosity: parse_env("OPTOREG_VERBOSITY", d.verbosity),
        allow_cisc_spill: parse_env("OPTOREG_CISC_SPILL", d.allow_cisc_spill),
        pressure_aware_scheduling: parse_env("OPTOREG_PRESSURE_AWARE_SCHEDULING", d.pressure_aware_scheduling),
        coalesce: parse_env("OPTOREG_COALESCE", d.coalesce),
        int_regs: parse_env("OPTOREG_INT_REGS", d.int_regs),
        float_regs: parse_env("OPTOREG_FLOAT_REGS", d.float_regs),
        max_spill_rounds: parse_env("OPTOREG_MAX_SPILL_ROUNDS", d.max_spill_rounds),
        verify: parse_env("OPTOREG_VERIFY", d.verify),
        error_as_deopt: parse_env("OPTOREG_ERROR_AS_DEOPT", d.error_as_deopt),
        trace_cisc_spill: parse_env("OPTOREG_TRACE_CISC_SPILL", d.trace_cisc_spill),
        trace_spilling: parse_env("OPTOREG_TRACE_SPILLING", d.trace_spilling),
        use_perf_data: parse_env("OPTOREG_USE_PERF_DATA", d.use_perf_data),
    };

    if !cfg!(debug_assertions) && c.verbosity > 16 {
        log::warn!("Verbosity level above 16 is only available in debug builds: {}", c.verbosity);
    }

    c
}

static CELL: LazyLock<OptoConfig> = LazyLock::new(create_config);

pub fn get_config() -> &'static OptoConfig {
    &CELL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_accepts_yes_no() {
        std::env::set_var("OPTOREG_TEST_FLAG_YES", "yes");
        std::env::set_var("OPTOREG_TEST_FLAG_ZERO", "0");
        assert_eq!(parse_env_opt::<bool>("OPTOREG_TEST_FLAG_YES"), Some(true));
        assert_eq!(parse_env_opt::<bool>("OPTOREG_TEST_FLAG_ZERO"), Some(false));
        assert_eq!(parse_env("OPTOREG_TEST_FLAG_MISSING", 7u32), 7);
    }

    #[test]
    fn unparsable_value_falls_back_to_default() {
        std::env::set_var("OPTOREG_TEST_BAD_NUMBER", "many");
        assert_eq!(parse_env("OPTOREG_TEST_BAD_NUMBER", 3u8), 3);
    }

    #[test]
    fn limits_follow_register_counts() {
        let conf = OptoConfig { int_regs: 3, float_regs: 5, ..OptoConfig::default() };
        assert_eq!(conf.reg_limits(), [3, 5]);
        assert_eq!(conf.reg_limit(RegClass::Float), 5);
    }
}
