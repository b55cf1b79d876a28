//! Integrating storage models: reservoirs and lakes.
//!
//! Both balance inflow against outflow over a validated storage curve. A
//! reservoir can additionally receive data-driven inflow (rainfall feeds,
//! observed series) over the bus; a lake evaporates over a surface area
//! estimated from the local slope of its storage curve.
//!
//! State variables: `volume` (m^3), `water_level` (m), `outflow` (m^3/s),
//! `inflow` (m^3/s). Parameters: `storage_curve` as `(volume, level)`
//! pairs, plus `evaporation_rate_m_per_s` for lakes.

use log::{info, warn};

use crate::bus::Message;
use crate::errors::{ComponentError, IdentificationError};
use crate::numerics::{interp, minimize, Method};
use crate::physics::storage::StorageCurve;
use crate::physics::{
    curve_param, require_series, scalar_param, Action, IdentificationData, Parameters,
    ParamValue, PhysicalComponent, State,
};

/// Sample spacing assumed by the offline storage-curve estimator (hourly
/// observations).
const IDENTIFICATION_SAMPLE_DT: f64 = 3600.0;

/// A reservoir whose level follows its storage curve. Physical inflow is
/// pushed by the harness; data-driven inflow accumulates from a subscribed
/// topic within a tick and resets after each step.
pub struct Reservoir {
    id: String,
    curve: StorageCurve,
    volume: f64,
    water_level: f64,
    outflow: f64,
    inflow: f64,
    physical_inflow: f64,
    data_inflow: f64,
}

impl Reservoir {
    pub fn new(
        id: &str,
        initial_state: &State,
        parameters: &Parameters,
    ) -> Result<Self, ComponentError> {
        let points = curve_param(parameters, "storage_curve").ok_or_else(|| {
            ComponentError::InvalidParameter(format!(
                "reservoir '{id}' requires a 'storage_curve' parameter"
            ))
        })?;
        let curve = StorageCurve::new(points)?;

        let volume = initial_state.get("volume").copied().unwrap_or(0.0);
        let water_level = curve.level_for(volume);
        Ok(Reservoir {
            id: id.to_string(),
            curve,
            volume,
            water_level,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            inflow: initial_state.get("inflow").copied().unwrap_or(0.0),
            physical_inflow: 0.0,
            data_inflow: 0.0,
        })
    }

    pub fn storage_curve(&self) -> &StorageCurve {
        &self.curve
    }
}

impl PhysicalComponent for Reservoir {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, dt: f64) -> State {
        let total_inflow = self.physical_inflow + self.data_inflow;
        // A commanded outflow replaces the previous one; otherwise the last
        // commanded value keeps draining.
        let outflow = action.outflow.unwrap_or(self.outflow);

        let delta = (total_inflow - outflow) * dt;
        self.volume = (self.volume + delta).max(0.0);
        self.water_level = self.curve.level_for(self.volume);
        self.outflow = outflow;
        self.inflow = total_inflow;

        // Data-driven inflow only counts for the tick it arrived in.
        self.data_inflow = 0.0;
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("volume".to_string(), self.volume),
            ("water_level".to_string(), self.water_level),
            ("outflow".to_string(), self.outflow),
            ("inflow".to_string(), self.inflow),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(volume) = state.get("volume") {
            self.volume = *volume;
            self.water_level = self.curve.level_for(self.volume);
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
        if let Some(inflow) = state.get("inflow") {
            self.inflow = *inflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([(
            "storage_curve".to_string(),
            ParamValue::Curve(self.curve.points()),
        )])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(points) = curve_param(params, "storage_curve") {
            self.curve = StorageCurve::new(points)?;
            self.water_level = self.curve.level_for(self.volume);
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn handle_message(&mut self, message: &Message) {
        if let Some(value) = message
            .scalar("control_signal")
            .or_else(|| message.scalar("inflow_rate"))
        {
            self.data_inflow += value;
        }
    }

    fn identify_parameters(
        &self,
        data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        identify_storage_curve(&self.id, &self.curve, data)
    }
}

/// A lake: the same water balance as a reservoir plus evaporation over the
/// local surface area, and a commanded outflow limited to what the stored
/// volume can supply within one step.
pub struct Lake {
    id: String,
    curve: StorageCurve,
    evaporation_rate: f64,
    volume: f64,
    water_level: f64,
    outflow: f64,
    inflow: f64,
    physical_inflow: f64,
}

impl Lake {
    pub fn new(
        id: &str,
        initial_state: &State,
        parameters: &Parameters,
    ) -> Result<Self, ComponentError> {
        let points = curve_param(parameters, "storage_curve").ok_or_else(|| {
            ComponentError::InvalidParameter(format!(
                "lake '{id}' requires a 'storage_curve' parameter"
            ))
        })?;
        let curve = StorageCurve::new(points)?;

        let volume = initial_state.get("volume").copied().unwrap_or(0.0);
        let water_level = curve.level_for(volume);
        Ok(Lake {
            id: id.to_string(),
            curve,
            evaporation_rate: scalar_param(parameters, "evaporation_rate_m_per_s").unwrap_or(0.0),
            volume,
            water_level,
            outflow: initial_state.get("outflow").copied().unwrap_or(0.0),
            inflow: initial_state.get("inflow").copied().unwrap_or(0.0),
            physical_inflow: 0.0,
        })
    }
}

impl PhysicalComponent for Lake {
    fn id(&self) -> &str {
        &self.id
    }

    fn step(&mut self, action: &Action, dt: f64) -> State {
        let inflow = self.physical_inflow;

        // Evaporation scales with the free surface, which varies with the
        // stored volume.
        let surface_area = self.curve.surface_area_at(self.volume);
        let evaporation = self.evaporation_rate * surface_area;

        let mut outflow = action.outflow.unwrap_or(self.outflow);
        let max_outflow = if dt > 0.0 { self.volume / dt } else { 0.0 };
        outflow = outflow.min(max_outflow);

        let delta = (inflow - outflow - evaporation) * dt;
        self.volume = (self.volume + delta).max(0.0);
        self.water_level = self.curve.level_for(self.volume);
        self.outflow = outflow;
        self.inflow = inflow;
        self.state()
    }

    fn state(&self) -> State {
        State::from([
            ("volume".to_string(), self.volume),
            ("water_level".to_string(), self.water_level),
            ("outflow".to_string(), self.outflow),
            ("inflow".to_string(), self.inflow),
        ])
    }

    fn set_state(&mut self, state: &State) {
        if let Some(volume) = state.get("volume") {
            self.volume = *volume;
            self.water_level = self.curve.level_for(self.volume);
        }
        if let Some(outflow) = state.get("outflow") {
            self.outflow = *outflow;
        }
        if let Some(inflow) = state.get("inflow") {
            self.inflow = *inflow;
        }
    }

    fn parameters(&self) -> Parameters {
        Parameters::from([
            (
                "storage_curve".to_string(),
                ParamValue::Curve(self.curve.points()),
            ),
            (
                "evaporation_rate_m_per_s".to_string(),
                ParamValue::Scalar(self.evaporation_rate),
            ),
        ])
    }

    fn set_parameters(&mut self, params: &Parameters) -> Result<(), ComponentError> {
        if let Some(points) = curve_param(params, "storage_curve") {
            self.curve = StorageCurve::new(points)?;
            self.water_level = self.curve.level_for(self.volume);
        }
        if let Some(rate) = scalar_param(params, "evaporation_rate_m_per_s") {
            self.evaporation_rate = rate;
        }
        Ok(())
    }

    fn set_inflow(&mut self, inflow: f64) {
        self.physical_inflow = inflow;
    }

    fn identify_parameters(
        &self,
        data: &IdentificationData,
    ) -> Result<Parameters, IdentificationError> {
        identify_storage_curve(&self.id, &self.curve, data)
    }
}

/// Re-estimates the level support of a storage curve from observed inflow,
/// outflow and level series.
///
/// The volume support stays fixed; the level of each point is optimized by
/// simulating the water balance over the observation window and minimizing
/// the RMSE against observed levels. Neighbor bounds keep the candidate
/// levels monotonic.
fn identify_storage_curve(
    id: &str,
    curve: &StorageCurve,
    data: &IdentificationData,
) -> Result<Parameters, IdentificationError> {
    let inflows = require_series(data, "inflows")?;
    let outflows = require_series(data, "outflows")?;
    let observed_levels = require_series(data, "levels")?;

    let samples = inflows.len().min(outflows.len()).min(observed_levels.len());
    if samples < 2 {
        return Err(IdentificationError::InsufficientData {
            have: samples,
            need: 2,
        });
    }

    let volumes = curve.volumes().to_vec();
    let initial_levels = curve.levels().to_vec();

    let objective = |candidate_levels: &[f64]| -> f64 {
        // Simulate the balance from the first observed level under the
        // candidate curve.
        let mut simulated_volume = interp(observed_levels[0], candidate_levels, &volumes);
        let mut sum_sq = {
            let level = interp(simulated_volume, &volumes, candidate_levels);
            (level - observed_levels[0]).powi(2)
        };
        for i in 1..samples {
            simulated_volume +=
                (inflows[i - 1] - outflows[i - 1]) * IDENTIFICATION_SAMPLE_DT;
            let level = interp(simulated_volume, &volumes, candidate_levels);
            sum_sq += (level - observed_levels[i]).powi(2);
        }
        (sum_sq / samples as f64).sqrt()
    };

    let bounds: Vec<(f64, f64)> = (0..initial_levels.len())
        .map(|i| {
            let lo = if i > 0 {
                initial_levels[i - 1]
            } else {
                f64::NEG_INFINITY
            };
            let hi = if i + 1 < initial_levels.len() {
                initial_levels[i + 1]
            } else {
                f64::INFINITY
            };
            (lo, hi)
        })
        .collect();

    let result = minimize(
        objective,
        &initial_levels,
        Some(&bounds),
        Method::ProjectedGradient,
    );

    if result.converged {
        info!("storage curve identification succeeded for '{id}' (rmse {:.4})", result.fun);
        let points: Vec<(f64, f64)> = volumes.into_iter().zip(result.x).collect();
        Ok(Parameters::from([(
            "storage_curve".to_string(),
            ParamValue::Curve(points),
        )]))
    } else {
        warn!("storage curve identification failed for '{id}': {}", result.message);
        Err(IdentificationError::NotConverged(result.message))
    }
}
