//! Propagation loss and delay.
//!
//! All functions are pure in the distance between the two antennas at the
//! moment the transmission starts.

use serde::{Deserialize, Serialize};

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Closed set of loss models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropagationLossModel {
    /// Free-space loss at every distance.
    Friis,
    /// Log-distance loss anchored at a fixed reference loss.
    LogDistance,
    /// Free-space below the reference distance, log-distance beyond it
    /// (anchored at the free-space loss of the reference distance).
    #[default]
    FriisLogDistance,
}

/// Loss and delay model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropagationConfig {
    /// Loss model.
    pub loss_model: PropagationLossModel,
    /// Path loss exponent of the log-distance regime.
    pub path_loss_exponent: f64,
    /// Reference distance d0 in meters.
    pub reference_distance_m: f64,
    /// Loss at d0 in dB, used by the plain log-distance model.
    pub reference_loss_db: f64,
    /// Friis system loss factor (dimensionless, >= 1).
    pub system_loss: f64,
    /// Lower bound on any computed loss in dB.
    pub min_loss_db: f64,
    /// Propagation speed in m/s.
    pub speed_m_per_s: f64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        PropagationConfig {
            loss_model: PropagationLossModel::FriisLogDistance,
            path_loss_exponent: 3.0,
            reference_distance_m: 1.0,
            reference_loss_db: 46.6777,
            system_loss: 1.0,
            min_loss_db: 0.0,
            speed_m_per_s: SPEED_OF_LIGHT,
        }
    }
}

impl PropagationConfig {
    /// Returns a description of the first invalid parameter, if any.
    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("path_loss_exponent", self.path_loss_exponent),
            ("reference_distance_m", self.reference_distance_m),
            ("reference_loss_db", self.reference_loss_db),
            ("system_loss", self.system_loss),
            ("min_loss_db", self.min_loss_db),
            ("speed_m_per_s", self.speed_m_per_s),
        ] {
            if !value.is_finite() {
                return Err(format!("{} must be finite, got {}", name, value));
            }
        }
        if !(self.path_loss_exponent > 0.0) {
            return Err(format!("path_loss_exponent must be > 0, got {}", self.path_loss_exponent));
        }
        if !(self.reference_distance_m > 0.0) {
            return Err(format!("reference_distance_m must be > 0, got {}", self.reference_distance_m));
        }
        if !(self.system_loss >= 1.0) {
            return Err(format!("system_loss must be >= 1, got {}", self.system_loss));
        }
        if !(self.speed_m_per_s > 0.0) {
            return Err(format!("speed_m_per_s must be > 0, got {}", self.speed_m_per_s));
        }
        Ok(())
    }
}

/// Propagation model bound to a carrier frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct PropagationModel {
    config: PropagationConfig,
    wavelength_m: f64,
}

impl PropagationModel {
    /// Create a model for the given carrier frequency.
    pub fn new(config: PropagationConfig, frequency_hz: f64) -> Self {
        PropagationModel {
            wavelength_m: SPEED_OF_LIGHT / frequency_hz,
            config,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Free-space loss in dB at `distance_m`.
    pub fn friis_loss_db(&self, distance_m: f64) -> f64 {
        if distance_m <= 0.0 {
            return self.config.min_loss_db;
        }
        let numerator = self.wavelength_m * self.wavelength_m;
        let denominator =
            16.0 * std::f64::consts::PI * std::f64::consts::PI * distance_m * distance_m * self.config.system_loss;
        (-10.0 * (numerator / denominator).log10()).max(self.config.min_loss_db)
    }

    fn log_distance_loss_db(&self, distance_m: f64, reference_loss_db: f64) -> f64 {
        let d0 = self.config.reference_distance_m;
        if distance_m <= d0 {
            return reference_loss_db;
        }
        reference_loss_db + 10.0 * self.config.path_loss_exponent * (distance_m / d0).log10()
    }

    /// Total loss in dB at `distance_m`.
    pub fn loss_db(&self, distance_m: f64) -> f64 {
        let loss = match self.config.loss_model {
            PropagationLossModel::Friis => self.friis_loss_db(distance_m),
            PropagationLossModel::LogDistance => {
                self.log_distance_loss_db(distance_m, self.config.reference_loss_db)
            }
            PropagationLossModel::FriisLogDistance => {
                let d0 = self.config.reference_distance_m;
                let friis = self.friis_loss_db(distance_m);
                if distance_m <= d0 {
                    friis
                } else {
                    friis.max(self.log_distance_loss_db(distance_m, self.friis_loss_db(d0)))
                }
            }
        };
        loss.max(self.config.min_loss_db)
    }

    /// Received power in dBm for a transmission at `tx_power_dbm`.
    pub fn received_power_dbm(&self, tx_power_dbm: f64, distance_m: f64) -> f64 {
        tx_power_dbm - self.loss_db(distance_m)
    }

    /// Time for a signal to cover `distance_m`, in nanoseconds.
    pub fn delay_nanos(&self, distance_m: f64) -> u64 {
        (distance_m.max(0.0) / self.config.speed_m_per_s * 1e9).round() as u64
    }
}

/// Returns true if a signal at `rx_power_dbm` can be decoded against `threshold_dbm`.
pub fn deliverable(rx_power_dbm: f64, threshold_dbm: f64) -> bool {
    rx_power_dbm >= threshold_dbm
}
