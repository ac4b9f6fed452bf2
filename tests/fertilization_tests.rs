use agribus::actuators::fertilization::{
    Coverage, FertilizationController, FertilizationMode, Npk, Product, RecommendationReason, ZoneSample,
};
use agribus::actuators::Actuator;
use agribus::bus::{ActuatorCommand, ActuatorKind, BaudRate, BusHandle, BusTransport, CommandCode};
use agribus::config::FertilizationConfig;
use agribus::error::FertilizationError;
use agribus::events::{EventKind, EventLog};

fn controller() -> FertilizationController {
    FertilizationController::new("FERT_TEST", 500.0, 200.0)
}

fn loaded(product: Product, amount_kg: f64, mode: FertilizationMode) -> FertilizationController {
    let mut fertilization = controller();
    fertilization.load_product(product, amount_kg).unwrap();
    fertilization.start(mode);
    fertilization
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[cfg(test)]
mod tank_tests {
    use super::*;

    #[test]
    fn test_tank_starts_full_without_product() {
        let fertilization = controller();
        assert_eq!(fertilization.tank_level_kg(), 500.0);
        assert_eq!(fertilization.tank_level_percent(), 100.0);
        assert!(fertilization.product().is_none());
    }

    #[test]
    fn test_load_replaces_contents() {
        let mut fertilization = controller();
        fertilization.load_product(Product::Urea, 120.0).unwrap();
        assert_eq!(fertilization.product(), Some(Product::Urea));
        assert_eq!(fertilization.tank_level_kg(), 120.0);

        fertilization.load_product(Product::Npk15_15_15, 80.0).unwrap();
        assert_eq!(fertilization.product(), Some(Product::Npk15_15_15));
        assert_eq!(fertilization.tank_level_kg(), 80.0);
    }

    #[test]
    fn test_load_refused_while_active() {
        let mut fertilization = loaded(Product::Urea, 100.0, FertilizationMode::Manual);
        assert_eq!(
            fertilization.load_product(Product::Npk20_10_10, 50.0),
            Err(FertilizationError::SystemActive)
        );
        assert_eq!(fertilization.product(), Some(Product::Urea));
        assert_eq!(fertilization.tank_level_kg(), 100.0);
    }

    #[test]
    fn test_load_over_capacity_refused() {
        let mut fertilization = controller();
        assert_eq!(
            fertilization.load_product(Product::Urea, 600.0),
            Err(FertilizationError::CapacityExceeded {
                amount_kg: 600.0,
                capacity_kg: 500.0,
            })
        );
        assert!(fertilization.product().is_none());
    }
}

#[cfg(test)]
mod application_tests {
    use super::*;

    #[test]
    fn test_full_application() {
        let mut fertilization = loaded(Product::Npk20_10_10, 300.0, FertilizationMode::Manual);
        fertilization.set_rate(80.0).unwrap();

        let application = fertilization.apply(2.0).unwrap();
        assert_eq!(application.coverage, Coverage::Full);
        assert_eq!(application.amount_kg, 160.0);
        assert_eq!(application.area_ha, 2.0);
        assert_eq!(application.tank_remaining_kg, 140.0);
        assert!(approx(application.nutrients_kg.n, 32.0));
        assert!(approx(application.nutrients_kg.p, 16.0));
        assert!(approx(application.nutrients_kg.k, 16.0));
    }

    #[test]
    fn test_insufficient_tank_clamps_area() {
        let log = EventLog::shared();
        let mut fertilization = controller().with_events(log.clone());
        fertilization.load_product(Product::Npk20_10_10, 300.0).unwrap();
        fertilization.start(FertilizationMode::Manual);
        fertilization.set_rate(80.0).unwrap();

        let application = fertilization.apply(5.0).unwrap();
        assert_eq!(application.requested_area_ha, 5.0);
        assert!(approx(application.area_ha, 3.75));
        assert_eq!(application.amount_kg, 300.0);
        assert_eq!(application.coverage, Coverage::Partial { shortfall_kg: 100.0 });
        assert_eq!(fertilization.tank_level_kg(), 0.0);
        assert!(approx(fertilization.area_covered_ha(), 3.75));

        // Shortfall warning plus the low-tank warning.
        assert_eq!(log.count_matching(|k| matches!(k, EventKind::AlertRaised { .. })), 2);
    }

    #[test]
    fn test_set_rate_error_order() {
        let mut fertilization = controller();
        assert_eq!(fertilization.set_rate(50.0), Err(FertilizationError::NotActive));

        fertilization.start(FertilizationMode::Manual);
        assert_eq!(fertilization.set_rate(50.0), Err(FertilizationError::NoProductLoaded));

        fertilization.stop();
        fertilization.load_product(Product::Urea, 100.0).unwrap();
        fertilization.start(FertilizationMode::Manual);
        assert!(matches!(
            fertilization.set_rate(250.0),
            Err(FertilizationError::OutOfRange { .. })
        ));
        assert_eq!(fertilization.application_rate(), 0.0);
    }

    #[test]
    fn test_apply_error_order() {
        let mut fertilization = controller();
        assert_eq!(fertilization.apply(1.0), Err(FertilizationError::NotActive));

        fertilization.start(FertilizationMode::Manual);
        assert_eq!(fertilization.apply(1.0), Err(FertilizationError::NoProductLoaded));

        fertilization.stop();
        fertilization.load_product(Product::Urea, 100.0).unwrap();
        fertilization.start(FertilizationMode::Manual);
        assert_eq!(fertilization.apply(1.0), Err(FertilizationError::ZeroRate));
        assert_eq!(fertilization.application_count(), 0);
        assert_eq!(fertilization.tank_level_kg(), 100.0);
    }

    #[test]
    fn test_statistics() {
        let mut fertilization = loaded(Product::Npk15_15_15, 500.0, FertilizationMode::Manual);
        fertilization.set_rate(100.0).unwrap();
        fertilization.apply(1.0).unwrap();
        fertilization.apply(1.5).unwrap();

        let stats = fertilization.statistics();
        assert_eq!(stats.application_count, 2);
        assert_eq!(stats.total_applied_kg, 250.0);
        assert!(approx(stats.total_applied_tonnes, 0.25));
        assert_eq!(stats.area_covered_ha, 2.5);
        assert_eq!(stats.average_rate_kg_ha, 100.0);
        assert!(stats.last_application.is_some());
    }

    #[test]
    fn test_stop_keeps_tank_and_resets_rate() {
        let mut fertilization = loaded(Product::Urea, 200.0, FertilizationMode::Manual);
        fertilization.set_rate(50.0).unwrap();
        fertilization.apply(1.0).unwrap();

        fertilization.stop();
        fertilization.stop();
        assert!(!fertilization.is_active());
        assert_eq!(fertilization.mode(), FertilizationMode::Off);
        assert_eq!(fertilization.application_rate(), 0.0);
        assert_eq!(fertilization.tank_level_kg(), 150.0);
    }
}

#[cfg(test)]
mod recommendation_tests {
    use super::*;

    #[test]
    fn test_high_nitrogen_deficit() {
        let fertilization = controller();
        let recommendation = fertilization.recommend(Npk::new(15.0, 8.0, 25.0));

        assert_eq!(recommendation.deficits, Npk::new(15.0, 7.0, 15.0));
        assert_eq!(recommendation.product, Some(Product::Npk20_10_10));
        assert_eq!(recommendation.reason, RecommendationReason::HighNitrogenDeficit);
        assert!(approx(recommendation.rate_kg_ha, 37.0));
    }

    #[test]
    fn test_single_nutrient_priority() {
        let fertilization = controller();

        let phosphorus = fertilization.recommend(Npk::new(30.0, 2.0, 40.0));
        assert_eq!(phosphorus.product, Some(Product::Npk04_14_08));
        assert_eq!(phosphorus.reason, RecommendationReason::HighPhosphorusDeficit);

        let potassium = fertilization.recommend(Npk::new(30.0, 15.0, 20.0));
        assert_eq!(potassium.product, Some(Product::Npk10_20_20));
        assert_eq!(potassium.reason, RecommendationReason::HighPotassiumDeficit);
    }

    #[test]
    fn test_balanced_and_adequate() {
        let fertilization = controller();

        let balanced = fertilization.recommend(Npk::new(22.0, 10.0, 30.0));
        assert_eq!(balanced.product, Some(Product::Npk15_15_15));
        assert_eq!(balanced.reason, RecommendationReason::BalancedDeficit);
        assert!(approx(balanced.rate_kg_ha, 23.0));

        // Sum of exactly 15 is not enough.
        let adequate = fertilization.recommend(Npk::new(25.0, 10.0, 35.0));
        assert_eq!(adequate.product, None);
        assert_eq!(adequate.reason, RecommendationReason::LevelsAdequate);
        assert_eq!(adequate.rate_kg_ha, 0.0);
    }

    #[test]
    fn test_rate_capped_at_max() {
        let fertilization = FertilizationController::new("FERT_TEST", 500.0, 20.0);
        let recommendation = fertilization.recommend(Npk::default());
        assert_eq!(recommendation.rate_kg_ha, 20.0);
    }

    #[test]
    fn test_configured_target() {
        let config = FertilizationConfig {
            target_npk: Npk::new(10.0, 10.0, 10.0),
            ..FertilizationConfig::default()
        };
        let fertilization = FertilizationController::from_config(&config);
        let recommendation = fertilization.recommend(Npk::new(15.0, 8.0, 25.0));
        assert_eq!(recommendation.deficits, Npk::new(0.0, 2.0, 0.0));
        assert_eq!(recommendation.product, None);
    }

    #[test]
    fn test_recommend_does_not_touch_state() {
        let fertilization = loaded(Product::Urea, 100.0, FertilizationMode::Manual);
        let before = fertilization.status();
        let _ = fertilization.recommend(Npk::default());
        let after = fertilization.status();
        assert_eq!(before.tank_level_kg, after.tank_level_kg);
        assert_eq!(before.application_rate_kg_ha, after.application_rate_kg_ha);
    }
}

#[cfg(test)]
mod variable_rate_tests {
    use super::*;

    fn zones() -> Vec<ZoneSample> {
        vec![
            ZoneSample {
                area_ha: 1.0,
                npk: Npk::new(15.0, 8.0, 25.0),
            },
            ZoneSample {
                area_ha: 2.0,
                npk: Npk::new(30.0, 15.0, 40.0),
            },
            ZoneSample {
                area_ha: 1.0,
                npk: Npk::new(22.0, 10.0, 30.0),
            },
        ]
    }

    #[test]
    fn test_zones_skipped_when_adequate() {
        let mut fertilization = loaded(Product::Npk15_15_15, 300.0, FertilizationMode::VariableRate);

        let results = fertilization.variable_rate_apply(&zones()).unwrap();
        let numbers: Vec<usize> = results.iter().map(|r| r.zone).collect();
        assert_eq!(numbers, vec![1, 3]);

        assert!(approx(results[0].application.amount_kg, 37.0));
        assert!(approx(results[1].application.amount_kg, 23.0));
        assert!(approx(fertilization.tank_level_kg(), 240.0));
        assert_eq!(fertilization.application_count(), 2);
    }

    #[test]
    fn test_ignored_outside_variable_rate_mode() {
        let mut fertilization = loaded(Product::Npk15_15_15, 300.0, FertilizationMode::Manual);

        let results = fertilization.variable_rate_apply(&zones()).unwrap();
        assert!(results.is_empty());
        assert_eq!(fertilization.tank_level_kg(), 300.0);
    }

    #[test]
    fn test_bad_zone_rejects_whole_pass() {
        let log = EventLog::shared();
        let mut fertilization = controller().with_events(log.clone());
        fertilization.load_product(Product::Npk15_15_15, 300.0).unwrap();
        fertilization.start(FertilizationMode::VariableRate);

        let mut zones = zones();
        zones[1].area_ha = -1.0;

        assert!(matches!(
            fertilization.variable_rate_apply(&zones),
            Err(FertilizationError::OutOfRange { value, .. }) if value == -1.0
        ));
        assert_eq!(fertilization.tank_level_kg(), 300.0);
        assert_eq!(fertilization.application_count(), 0);
        assert_eq!(fertilization.total_applied_kg(), 0.0);
        assert_eq!(
            log.count_matching(|k| matches!(k, EventKind::FertilizationPerformed { .. })),
            0
        );
    }

    #[test]
    fn test_pass_without_product_is_refused() {
        let mut fertilization = controller();
        fertilization.start(FertilizationMode::VariableRate);

        assert_eq!(
            fertilization.variable_rate_apply(&zones()),
            Err(FertilizationError::NoProductLoaded)
        );
        assert_eq!(fertilization.application_count(), 0);
    }
}

#[cfg(test)]
mod bus_traffic_tests {
    use super::*;

    #[test]
    fn test_rate_and_status_commands() {
        let mut bus = BusTransport::new("CAN_TEST", BaudRate::Rate250K, 0x01);
        bus.activate();
        let bus = BusHandle::new(bus);

        let mut fertilization = controller().with_bus(bus.clone());
        fertilization.load_product(Product::Urea, 500.0).unwrap();
        fertilization.start(FertilizationMode::Manual);
        fertilization.set_rate(80.5).unwrap();
        fertilization.apply(1.0).unwrap();

        let sent: Vec<ActuatorCommand> = bus
            .with(|bus| bus.take_transmitted(16))
            .iter()
            .filter_map(ActuatorCommand::decode)
            .collect();

        assert!(sent.iter().all(|c| c.kind == ActuatorKind::Fertilizer));
        let commands: Vec<(CommandCode, u16)> = sent.iter().map(|c| (c.command, c.value)).collect();
        // 500 - 80.5 = 419.5 kg left, 83.9 %
        assert_eq!(
            commands,
            vec![(CommandCode::Start, 0), (CommandCode::SetRate, 805), (CommandCode::Status, 84)]
        );
    }
}
