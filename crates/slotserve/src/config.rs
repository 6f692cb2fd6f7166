use std::path::PathBuf;

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use slotserve_core::{dummy::DummyConfig, SchedulerConfig, TaskParams};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub dummy: DummyConfig,
    /// Parameters applied to every prompt typed into the driver.
    pub params: TaskParams,
    pub driver: DriverOption,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct DriverOption {
    /// Tokens generated per prompt when `params.n_predict` is unset.
    #[derivative(Default(value = "128"))]
    pub n_predict: usize,
    /// Period of the waiting indicator, in milliseconds.
    #[derivative(Default(value = "80"))]
    pub tick_ms: u64,
    /// Directory for slot files if the scheduler table does not set one.
    #[derivative(Default(value = "Some(\"assets/slots\".into())"))]
    pub slot_path: Option<PathBuf>,
}

impl Config {
    /// Settings the driver fills in when the file leaves them open.
    pub fn resolve(mut self, slots: Option<usize>) -> Self {
        if let Some(n_slots) = slots {
            self.scheduler.n_slots = n_slots;
        }
        if self.params.n_predict.is_none() {
            self.params.n_predict = Some(self.driver.n_predict);
        }
        if self.scheduler.slot_save_path.is_none() {
            self.scheduler.slot_save_path = self.driver.slot_path.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn partial_tables_keep_defaults() {
        let config: Config = toml::from_str(
            r#"
            [scheduler]
            n_slots = 2
            idle_wait = 10

            [dummy]
            step_delay_ms = 3

            [params]
            stop = ["\n\n"]
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.n_slots, 2);
        assert_eq!(config.scheduler.n_batch, 512);
        assert_eq!(config.scheduler.idle_wait, Duration::from_millis(10));
        assert_eq!(config.dummy.step_delay_ms, 3);
        assert_eq!(config.dummy.n_ctx, 4096);
        assert_eq!(config.params.stop, vec!["\n\n".to_string()]);
        assert!(config.params.stream);
        assert_eq!(config.driver.n_predict, 128);
    }

    #[test]
    fn resolve_fills_open_settings() {
        let config = Config::default().resolve(Some(8));
        assert_eq!(config.scheduler.n_slots, 8);
        assert_eq!(config.params.n_predict, Some(128));
        assert_eq!(
            config.scheduler.slot_save_path,
            Some(PathBuf::from("assets/slots"))
        );

        let mut config = Config::default();
        config.params.n_predict = Some(4);
        config.scheduler.slot_save_path = Some("state".into());
        let config = config.resolve(None);
        assert_eq!(config.scheduler.n_slots, 4);
        assert_eq!(config.params.n_predict, Some(4));
        assert_eq!(config.scheduler.slot_save_path, Some(PathBuf::from("state")));
    }
}
