use chrono::{DateTime, Utc};
use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{publish_command, scaled_value, Actuator};
use crate::bus::{ActuatorKind, BusHandle, CommandCode};
use crate::config::FertilizationConfig;
use crate::error::FertilizationError;
use crate::events::{tracing_handle, AlertLevel, EventHandle, EventKind, FieldEvent};

/// A deficit above this in a single nutrient picks the product rich in it.
const SINGLE_NUTRIENT_THRESHOLD: f64 = 10.0;
/// Combined deficit above which a balanced product is recommended.
const BALANCED_THRESHOLD: f64 = 15.0;
/// kg/ha per mg/kg of mean deficit.
const RATE_PER_DEFICIT: f64 = 3.0;
const DEFAULT_LOW_TANK_PERCENT: f64 = 10.0;
/// Rate commands carry tenths of kg/ha.
const RATE_COMMAND_SCALE: f64 = 10.0;

/// Nutrient triple. Soil levels are mg/kg; product compositions are percent
/// by mass; applied amounts are kg.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Npk {
    pub n: f64,
    pub p: f64,
    pub k: f64,
}

impl Npk {
    pub const fn new(n: f64, p: f64, k: f64) -> Self {
        Self { n, p, k }
    }

    pub fn sum(&self) -> f64 {
        self.n + self.p + self.k
    }

    pub fn mean(&self) -> f64 {
        self.sum() / 3.0
    }

    /// Shortfall of `self` against `target`, never negative.
    pub fn deficit_to(&self, target: &Npk) -> Npk {
        Npk {
            n: (target.n - self.n).max(0.0),
            p: (target.p - self.p).max(0.0),
            k: (target.k - self.k).max(0.0),
        }
    }

    /// Nutrient mass in `kg` of a product with this percentage composition.
    pub fn portion_of(&self, kg: f64) -> Npk {
        Npk {
            n: kg * self.n / 100.0,
            p: kg * self.p / 100.0,
            k: kg * self.k / 100.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Product {
    #[serde(rename = "npk_20_10_10")]
    Npk20_10_10,
    #[serde(rename = "npk_10_20_20")]
    Npk10_20_20,
    #[serde(rename = "npk_15_15_15")]
    Npk15_15_15,
    #[serde(rename = "npk_04_14_08")]
    Npk04_14_08,
    #[serde(rename = "urea")]
    Urea,
}

impl Product {
    pub const ALL: [Product; 5] = [
        Product::Npk20_10_10,
        Product::Npk10_20_20,
        Product::Npk15_15_15,
        Product::Npk04_14_08,
        Product::Urea,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Product::Npk20_10_10 => "NPK 20-10-10",
            Product::Npk10_20_20 => "NPK 10-20-20",
            Product::Npk15_15_15 => "NPK 15-15-15",
            Product::Npk04_14_08 => "NPK 04-14-08",
            Product::Urea => "Urea 45-00-00",
        }
    }

    /// Percent by mass.
    pub fn composition(&self) -> Npk {
        match self {
            Product::Npk20_10_10 => Npk::new(20.0, 10.0, 10.0),
            Product::Npk10_20_20 => Npk::new(10.0, 20.0, 20.0),
            Product::Npk15_15_15 => Npk::new(15.0, 15.0, 15.0),
            Product::Npk04_14_08 => Npk::new(4.0, 14.0, 8.0),
            Product::Urea => Npk::new(45.0, 0.0, 0.0),
        }
    }

    fn key(&self) -> &'static str {
        match self {
            Product::Npk20_10_10 => "npk_20_10_10",
            Product::Npk10_20_20 => "npk_10_20_20",
            Product::Npk15_15_15 => "npk_15_15_15",
            Product::Npk04_14_08 => "npk_04_14_08",
            Product::Urea => "urea",
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProduct(pub String);

impl fmt::Display for UnknownProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown fertilizer product {:?}", self.0)
    }
}

impl std::error::Error for UnknownProduct {}

/// Accepts the serde key (`npk_20_10_10`) or the label (`NPK 20-10-10`),
/// case-insensitively.
impl FromStr for Product {
    type Err = UnknownProduct;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Product::ALL
            .into_iter()
            .find(|product| product.key() == wanted || product.label().to_ascii_lowercase() == wanted)
            .ok_or_else(|| UnknownProduct(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FertilizationMode {
    Manual,
    Automatic,
    VariableRate,
    #[default]
    Off,
}

impl fmt::Display for FertilizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FertilizationMode::Manual => write!(f, "manual"),
            FertilizationMode::Automatic => write!(f, "automatic"),
            FertilizationMode::VariableRate => write!(f, "variable_rate"),
            FertilizationMode::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationReason {
    HighNitrogenDeficit,
    HighPhosphorusDeficit,
    HighPotassiumDeficit,
    BalancedDeficit,
    LevelsAdequate,
}

impl fmt::Display for RecommendationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RecommendationReason::HighNitrogenDeficit => "high nitrogen deficit",
            RecommendationReason::HighPhosphorusDeficit => "high phosphorus deficit",
            RecommendationReason::HighPotassiumDeficit => "high potassium deficit",
            RecommendationReason::BalancedDeficit => "balanced deficit",
            RecommendationReason::LevelsAdequate => "levels adequate",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub current: Npk,
    pub target: Npk,
    pub deficits: Npk,
    pub product: Option<Product>,
    pub rate_kg_ha: f64,
    pub reason: RecommendationReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "coverage", rename_all = "snake_case")]
pub enum Coverage {
    Full,
    /// The tank ran out; `area_ha` in the application is what was covered.
    Partial { shortfall_kg: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub product: Product,
    pub requested_area_ha: f64,
    pub area_ha: f64,
    pub amount_kg: f64,
    pub rate_kg_ha: f64,
    pub tank_remaining_kg: f64,
    pub nutrients_kg: Npk,
    pub coverage: Coverage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneSample {
    pub area_ha: f64,
    pub npk: Npk,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneApplication {
    /// 1-based position in the input.
    pub zone: usize,
    pub recommendation: Recommendation,
    pub application: Application,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FertilizationStatus {
    pub system_id: String,
    pub active: bool,
    pub mode: FertilizationMode,
    pub product: Option<Product>,
    pub tank_level_kg: f64,
    pub tank_capacity_kg: f64,
    pub tank_level_percent: f64,
    pub application_rate_kg_ha: f64,
    pub max_rate_kg_ha: f64,
    pub total_applied_kg: f64,
    pub area_covered_ha: f64,
    pub application_count: u32,
    pub last_application: Option<DateTime<Utc>>,
    pub target_npk: Npk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FertilizationStatistics {
    pub total_applied_kg: f64,
    pub total_applied_tonnes: f64,
    pub area_covered_ha: f64,
    pub average_rate_kg_ha: f64,
    pub application_count: u32,
    pub last_application: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct FertilizationController {
    system_id: String,
    tank_capacity_kg: f64,
    max_rate: f64,
    target_npk: Npk,
    low_tank_alert_percent: f64,

    active: bool,
    mode: FertilizationMode,
    product: Option<Product>,
    tank_level_kg: f64,
    application_rate: f64,

    total_applied_kg: f64,
    area_covered_ha: f64,
    application_count: u32,
    last_application: Option<DateTime<Utc>>,

    bus: Option<BusHandle>,
    events: EventHandle,
}

impl FertilizationController {
    /// The tank level starts at capacity with no product loaded, so an
    /// application needs `load_product` first.
    pub fn new(system_id: impl Into<String>, tank_capacity_kg: f64, max_rate: f64) -> Self {
        let controller = Self {
            system_id: system_id.into(),
            tank_capacity_kg,
            max_rate,
            target_npk: Npk::new(30.0, 15.0, 40.0),
            low_tank_alert_percent: DEFAULT_LOW_TANK_PERCENT,
            active: false,
            mode: FertilizationMode::Off,
            product: None,
            tank_level_kg: tank_capacity_kg,
            application_rate: 0.0,
            total_applied_kg: 0.0,
            area_covered_ha: 0.0,
            application_count: 0,
            last_application: None,
            bus: None,
            events: tracing_handle(),
        };
        info!(
            system = %controller.system_id,
            tank_capacity_kg,
            max_rate,
            "fertilization system initialized"
        );
        controller
    }

    pub fn from_config(config: &FertilizationConfig) -> Self {
        let mut controller = Self::new(config.system_id.clone(), config.tank_capacity_kg, config.max_rate);
        controller.target_npk = config.target_npk;
        controller.low_tank_alert_percent = config.low_tank_alert_percent;
        controller
    }

    pub fn with_bus(mut self, bus: BusHandle) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_events(mut self, events: EventHandle) -> Self {
        self.events = events;
        self
    }

    pub fn set_target_npk(&mut self, target: Npk) {
        self.target_npk = target;
    }

    /// Replace the tank contents. Only allowed while the system is stopped.
    pub fn load_product(&mut self, product: Product, amount_kg: f64) -> Result<(), FertilizationError> {
        if self.active {
            return Err(FertilizationError::SystemActive);
        }
        if !(amount_kg >= 0.0) {
            return Err(FertilizationError::OutOfRange {
                value: amount_kg,
                max: self.tank_capacity_kg,
            });
        }
        if amount_kg > self.tank_capacity_kg {
            return Err(FertilizationError::CapacityExceeded {
                amount_kg,
                capacity_kg: self.tank_capacity_kg,
            });
        }

        self.product = Some(product);
        self.tank_level_kg = amount_kg;
        info!(system = %self.system_id, %product, amount_kg, "tank loaded");
        Ok(())
    }

    pub fn set_rate(&mut self, rate_kg_ha: f64) -> Result<(), FertilizationError> {
        if !self.active {
            return Err(FertilizationError::NotActive);
        }
        if self.product.is_none() {
            return Err(FertilizationError::NoProductLoaded);
        }
        if !(0.0..=self.max_rate).contains(&rate_kg_ha) {
            return Err(FertilizationError::OutOfRange {
                value: rate_kg_ha,
                max: self.max_rate,
            });
        }

        self.application_rate = rate_kg_ha;
        info!(system = %self.system_id, rate_kg_ha, "application rate set");
        publish_command(
            self.bus.as_ref(),
            &self.system_id,
            ActuatorKind::Fertilizer,
            CommandCode::SetRate,
            scaled_value(rate_kg_ha, RATE_COMMAND_SCALE),
        );
        Ok(())
    }

    /// Spread the loaded product over `area_ha` at the current rate. When the
    /// tank cannot cover the whole area the application is clamped to what is
    /// left and reported as `Coverage::Partial`.
    pub fn apply(&mut self, area_ha: f64) -> Result<Application, FertilizationError> {
        if !self.active {
            return Err(FertilizationError::NotActive);
        }
        let product = self.product.ok_or(FertilizationError::NoProductLoaded)?;
        if self.application_rate == 0.0 {
            return Err(FertilizationError::ZeroRate);
        }
        if !(area_ha >= 0.0) {
            return Err(FertilizationError::OutOfRange {
                value: area_ha,
                max: f64::INFINITY,
            });
        }

        let rate = self.application_rate;
        let required_kg = rate * area_ha;
        let (amount_kg, covered_ha, coverage) = if required_kg > self.tank_level_kg {
            let available = self.tank_level_kg;
            let shortfall_kg = required_kg - available;
            warn!(
                system = %self.system_id,
                required_kg,
                available_kg = available,
                "insufficient product, application clamped"
            );
            self.raise_alert(
                AlertLevel::Warning,
                format!(
                    "insufficient product: required {:.1} kg, available {:.1} kg",
                    required_kg, available
                ),
            );
            (available, available / rate, Coverage::Partial { shortfall_kg })
        } else {
            (required_kg, area_ha, Coverage::Full)
        };

        self.tank_level_kg = (self.tank_level_kg - amount_kg).max(0.0);
        self.total_applied_kg += amount_kg;
        self.area_covered_ha += covered_ha;
        self.application_count += 1;
        self.last_application = Some(Utc::now());

        debug_assert!(
            self.tank_level_kg >= 0.0 && self.tank_level_kg <= self.tank_capacity_kg,
            "Tank level {} outside 0..={}",
            self.tank_level_kg,
            self.tank_capacity_kg
        );

        info!(
            system = %self.system_id,
            %product,
            area_ha = covered_ha,
            amount_kg,
            tank_remaining_kg = self.tank_level_kg,
            "fertilizer applied"
        );
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::FertilizationPerformed {
                product,
                amount_kg,
                area_ha: covered_ha,
            },
        ));

        let tank_percent = self.tank_level_percent();
        publish_command(
            self.bus.as_ref(),
            &self.system_id,
            ActuatorKind::Fertilizer,
            CommandCode::Status,
            scaled_value(tank_percent, 1.0),
        );
        if tank_percent < self.low_tank_alert_percent {
            self.raise_alert(
                AlertLevel::Warning,
                format!("tank level low: {:.1}% remaining", tank_percent),
            );
        }

        Ok(Application {
            product,
            requested_area_ha: area_ha,
            area_ha: covered_ha,
            amount_kg,
            rate_kg_ha: rate,
            tank_remaining_kg: self.tank_level_kg,
            nutrients_kg: product.composition().portion_of(amount_kg),
            coverage,
        })
    }

    /// Pick a corrective product for measured soil levels. Never touches
    /// controller state.
    pub fn recommend(&self, current: Npk) -> Recommendation {
        let deficits = current.deficit_to(&self.target_npk);

        let (product, reason) = if deficits.n > SINGLE_NUTRIENT_THRESHOLD {
            (Some(Product::Npk20_10_10), RecommendationReason::HighNitrogenDeficit)
        } else if deficits.p > SINGLE_NUTRIENT_THRESHOLD {
            (Some(Product::Npk04_14_08), RecommendationReason::HighPhosphorusDeficit)
        } else if deficits.k > SINGLE_NUTRIENT_THRESHOLD {
            (Some(Product::Npk10_20_20), RecommendationReason::HighPotassiumDeficit)
        } else if deficits.sum() > BALANCED_THRESHOLD {
            (Some(Product::Npk15_15_15), RecommendationReason::BalancedDeficit)
        } else {
            (None, RecommendationReason::LevelsAdequate)
        };

        let rate_kg_ha = match product {
            Some(_) => (deficits.mean() * RATE_PER_DEFICIT).min(self.max_rate),
            None => 0.0,
        };

        Recommendation {
            current,
            target: self.target_npk,
            deficits,
            product,
            rate_kg_ha,
            reason,
        }
    }

    /// Per-zone recommend-then-apply in variable-rate mode. The tank holds a
    /// single product, so each zone is dosed with what is loaded at the rate
    /// recommended for it. Zones needing no correction are skipped.
    ///
    /// Every zone is checked before the first one is dosed, so a rejected
    /// pass leaves the controller untouched.
    pub fn variable_rate_apply(&mut self, zones: &[ZoneSample]) -> Result<Vec<ZoneApplication>, FertilizationError> {
        if self.mode != FertilizationMode::VariableRate {
            warn!(system = %self.system_id, mode = %self.mode, "variable rate pass ignored outside variable rate mode");
            return Ok(Vec::new());
        }
        if !self.active {
            return Err(FertilizationError::NotActive);
        }
        if self.product.is_none() {
            return Err(FertilizationError::NoProductLoaded);
        }
        if let Some(zone) = zones.iter().find(|zone| !(zone.area_ha >= 0.0 && zone.area_ha.is_finite())) {
            return Err(FertilizationError::OutOfRange {
                value: zone.area_ha,
                max: f64::INFINITY,
            });
        }

        let mut results = Vec::with_capacity(zones.len());
        for (index, zone) in zones.iter().enumerate() {
            let recommendation = self.recommend(zone.npk);
            if recommendation.product.is_none() {
                continue;
            }

            self.set_rate(recommendation.rate_kg_ha)?;
            let application = self.apply(zone.area_ha)?;
            results.push(ZoneApplication {
                zone: index + 1,
                recommendation,
                application,
            });
        }

        Ok(results)
    }

    fn raise_alert(&self, level: AlertLevel, message: String) {
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::AlertRaised { level, message },
        ));
    }

    pub fn tank_level_percent(&self) -> f64 {
        if self.tank_capacity_kg > 0.0 {
            self.tank_level_kg / self.tank_capacity_kg * 100.0
        } else {
            0.0
        }
    }

    pub fn product(&self) -> Option<Product> {
        self.product
    }

    pub fn tank_level_kg(&self) -> f64 {
        self.tank_level_kg
    }

    pub fn tank_capacity_kg(&self) -> f64 {
        self.tank_capacity_kg
    }

    pub fn application_rate(&self) -> f64 {
        self.application_rate
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    pub fn target_npk(&self) -> Npk {
        self.target_npk
    }

    pub fn total_applied_kg(&self) -> f64 {
        self.total_applied_kg
    }

    pub fn area_covered_ha(&self) -> f64 {
        self.area_covered_ha
    }

    pub fn application_count(&self) -> u32 {
        self.application_count
    }
}

impl Actuator for FertilizationController {
    type Mode = FertilizationMode;
    type Status = FertilizationStatus;
    type Statistics = FertilizationStatistics;

    fn system_id(&self) -> &str {
        &self.system_id
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn mode(&self) -> FertilizationMode {
        self.mode
    }

    fn start(&mut self, mode: FertilizationMode) {
        if mode == FertilizationMode::Off {
            self.stop();
            return;
        }

        self.active = true;
        self.mode = mode;
        info!(system = %self.system_id, %mode, "fertilization system active");
        publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Fertilizer, CommandCode::Start, 0);
        self.events.record(FieldEvent::new(
            self.system_id.clone(),
            EventKind::SystemStarted { mode: mode.to_string() },
        ));
    }

    fn stop(&mut self) {
        let was_active = self.active;

        self.active = false;
        self.mode = FertilizationMode::Off;
        self.application_rate = 0.0;

        if was_active {
            info!(system = %self.system_id, "fertilization system stopped");
            publish_command(self.bus.as_ref(), &self.system_id, ActuatorKind::Fertilizer, CommandCode::Stop, 0);
            self.events.record(FieldEvent::new(self.system_id.clone(), EventKind::SystemStopped));
        }
    }

    fn status(&self) -> FertilizationStatus {
        FertilizationStatus {
            system_id: self.system_id.clone(),
            active: self.active,
            mode: self.mode,
            product: self.product,
            tank_level_kg: self.tank_level_kg,
            tank_capacity_kg: self.tank_capacity_kg,
            tank_level_percent: self.tank_level_percent(),
            application_rate_kg_ha: self.application_rate,
            max_rate_kg_ha: self.max_rate,
            total_applied_kg: self.total_applied_kg,
            area_covered_ha: self.area_covered_ha,
            application_count: self.application_count,
            last_application: self.last_application,
            target_npk: self.target_npk,
        }
    }

    fn statistics(&self) -> FertilizationStatistics {
        FertilizationStatistics {
            total_applied_kg: self.total_applied_kg,
            total_applied_tonnes: self.total_applied_kg / 1000.0,
            area_covered_ha: self.area_covered_ha,
            average_rate_kg_ha: self.total_applied_kg / self.area_covered_ha.max(1.0),
            application_count: self.application_count,
            last_application: self.last_application,
        }
    }
}
