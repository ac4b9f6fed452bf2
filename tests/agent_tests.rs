use agribus::actuators::fertilization::Product;
use agribus::actuators::{Actuator, FertilizationMode, IrrigationMode, Npk};
use agribus::bus::vocabulary::encode_sensor_payload;
use agribus::bus::{AddressingMode, SensorKind};
use agribus::protocol::{ProtocolHandler, ResponseStatus};
use agribus::events::{EventKind, EventSink};
use agribus::protocol::MAX_RESPONSE_SIZE;
use agribus::{Command, CommandResponse, CommandType, FieldAgent, FieldConfig, FieldEvent, FieldSnapshot, SensorFeed};
use serde_json::json;

fn agent() -> FieldAgent {
    let mut agent = FieldAgent::new().unwrap();
    agent.start();
    agent
}

fn send(agent: &mut FieldAgent, id: u32, command_type: serde_json::Value) -> agribus::CommandResponse {
    let line = json!({ "id": id, "command_type": command_type }).to_string();
    let response = agent.execute_json(&line);
    assert_eq!(response.id, id, "response to {}", line);
    response
}

#[cfg(test)]
mod command_tests {
    use super::*;

    #[test]
    fn test_irrigation_over_json() {
        let mut agent = agent();

        let started = send(&mut agent, 1, json!({ "StartIrrigation": { "mode": "manual" } }));
        assert_eq!(started.status, ResponseStatus::Success);

        let run = send(&mut agent, 2, json!({ "IrrigateZone": { "zone": 2, "duration_minutes": 10.0 } }));
        assert_eq!(run.status, ResponseStatus::Success);
        let data = run.data.unwrap();
        assert_eq!(data["zone"], 2);
        assert_eq!(data["volume_liters"], 250.0);

        let unknown = send(&mut agent, 3, json!({ "OpenZone": { "zone": 9 } }));
        assert_eq!(unknown.status, ResponseStatus::Error);
        assert!(unknown.message.unwrap().contains("zone 9"));
    }

    #[test]
    fn test_fertilization_over_json() {
        let mut agent = agent();

        let load = send(
            &mut agent,
            1,
            json!({ "LoadProduct": { "product": "npk_20_10_10", "amount_kg": 300.0 } }),
        );
        assert_eq!(load.status, ResponseStatus::Success);

        send(&mut agent, 2, json!({ "StartFertilization": { "mode": "manual" } }));
        send(&mut agent, 3, json!({ "SetApplicationRate": { "rate_kg_ha": 80.0 } }));

        let applied = send(&mut agent, 4, json!({ "Apply": { "area_ha": 5.0 } }));
        assert_eq!(applied.status, ResponseStatus::Success);
        let data = applied.data.unwrap();
        assert_eq!(data["coverage"]["coverage"], "partial");
        assert_eq!(data["coverage"]["shortfall_kg"], 100.0);
        assert_eq!(data["tank_remaining_kg"], 0.0);

        assert_eq!(agent.fertilization().product(), Some(Product::Npk20_10_10));
        assert_eq!(agent.fertilization().tank_level_kg(), 0.0);
    }

    #[test]
    fn test_recommend_over_json() {
        let mut agent = agent();
        let response = send(
            &mut agent,
            1,
            json!({ "Recommend": { "npk": { "n": 15.0, "p": 8.0, "k": 25.0 } } }),
        );

        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.message.as_deref(), Some("high nitrogen deficit"));
        let data = response.data.unwrap();
        assert_eq!(data["product"], "npk_20_10_10");
        assert_eq!(data["reason"], "high_nitrogen_deficit");
    }

    #[test]
    fn test_invalid_commands() {
        let mut agent = agent();

        let zero_id = agent.execute(Command {
            id: 0,
            command_type: CommandType::Ping,
        });
        assert_eq!(zero_id.status, ResponseStatus::InvalidCommand);

        let bad_time = send(&mut agent, 5, json!({ "SetSchedule": { "times": ["06:00", "7pm"] } }));
        assert_eq!(bad_time.status, ResponseStatus::InvalidCommand);
        assert!(agent.irrigation().status().schedule.is_empty());

        let unknown = agent.execute_json(r#"{"id": 6, "command_type": "SelfDestruct"}"#);
        assert_eq!(unknown.id, 0);
        assert_eq!(unknown.status, ResponseStatus::InvalidCommand);

        let oversized = agent.execute_json(&" ".repeat(2000));
        assert_eq!(oversized.status, ResponseStatus::InvalidCommand);
    }

    #[test]
    fn test_publish_on_inactive_bus_is_error() {
        let mut agent = agent();
        send(&mut agent, 1, json!("BusDeactivate"));

        let response = send(
            &mut agent,
            2,
            json!({ "PublishSensor": { "sensor": "soil_moisture", "value": 40.0 } }),
        );
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.message.as_deref(), Some("bus is not active"));
    }

    #[test]
    fn test_schedule_reports_next_run() {
        let mut agent = agent();
        let response = send(&mut agent, 1, json!({ "SetSchedule": { "times": ["06:00", "18:00"] } }));

        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.data.unwrap().is_string());
        assert_eq!(agent.irrigation().status().schedule.len(), 2);
    }

    #[test]
    fn test_recent_events_limit() {
        let mut agent = agent();
        send(&mut agent, 1, json!({ "StartIrrigation": { "mode": "manual" } }));
        send(&mut agent, 2, json!({ "OpenZone": { "zone": 1 } }));
        send(&mut agent, 3, json!("StopIrrigation"));

        let response = send(&mut agent, 4, json!({ "RecentEvents": { "limit": 2 } }));
        let events = response.data.unwrap();
        assert_eq!(events.as_array().unwrap().len(), 2);
        assert_eq!(events[1]["kind"]["type"], "system_stopped");
        assert!(agent.event_log().len() > 2);
    }

    #[test]
    fn test_target_npk_changes_recommendation() {
        let mut agent = agent();
        let npk = json!({ "npk": { "n": 15.0, "p": 8.0, "k": 25.0 } });

        let before = send(&mut agent, 1, json!({ "Recommend": npk.clone() }));
        assert_eq!(before.data.unwrap()["product"], "npk_20_10_10");

        let target = send(&mut agent, 2, json!({ "SetTargetNpk": { "npk": { "n": 15.0, "p": 8.0, "k": 25.0 } } }));
        assert_eq!(target.status, ResponseStatus::Success);
        assert_eq!(agent.fertilization().target_npk(), Npk::new(15.0, 8.0, 25.0));

        let after = send(&mut agent, 3, json!({ "Recommend": npk }));
        assert_eq!(after.message.as_deref(), Some("levels adequate"));
        assert!(after.data.unwrap()["product"].is_null());

        let negative = send(&mut agent, 4, json!({ "SetTargetNpk": { "npk": { "n": -1.0, "p": 8.0, "k": 25.0 } } }));
        assert_eq!(negative.status, ResponseStatus::InvalidCommand);
        assert_eq!(agent.fertilization().target_npk(), Npk::new(15.0, 8.0, 25.0));
    }

    #[test]
    fn test_filter_table_full_is_error() {
        let mut agent = agent();
        for id in 0..64u32 {
            let added = send(&mut agent, id + 1, json!({ "AddFilter": { "identifier": 0x300 + id } }));
            assert_eq!(added.status, ResponseStatus::Success);
        }

        let full = send(&mut agent, 100, json!({ "AddFilter": { "identifier": 0x400 } }));
        assert_eq!(full.status, ResponseStatus::Error);
        assert!(full.message.unwrap().contains("filter table full"));
    }

    #[test]
    fn test_command_count() {
        let mut agent = agent();
        send(&mut agent, 1, json!("Ping"));
        send(&mut agent, 2, json!("BusStatus"));
        assert_eq!(agent.command_count(), 2);
    }
}

#[cfg(test)]
mod response_line_tests {
    use super::*;

    #[test]
    fn test_respond_json_renders_response() {
        let mut agent = agent();
        let line = agent.respond_json(r#"{"id": 42, "command_type": "Ping"}"#).unwrap();

        let response: CommandResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id, 42);
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(response.message.as_deref(), Some("pong"));
    }

    #[test]
    fn test_system_status_line_fits() {
        let mut agent = agent();
        let line = agent.respond_json(r#"{"id": 7, "command_type": "SystemStatus"}"#).unwrap();

        assert!(line.len() <= MAX_RESPONSE_SIZE);
        let response: CommandResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.status, ResponseStatus::Success);
        assert!(response.data.is_some());
    }

    #[test]
    fn test_oversized_response_becomes_error() {
        let mut agent = agent();
        for _ in 0..128 {
            agent
                .event_log()
                .record(FieldEvent::new("N".repeat(200), EventKind::SystemStopped));
        }

        let line = agent
            .respond_json(r#"{"id": 9, "command_type": {"RecentEvents": {"limit": 128}}}"#)
            .unwrap();
        assert!(line.len() <= MAX_RESPONSE_SIZE);

        let response: CommandResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.id, 9);
        assert_eq!(response.status, ResponseStatus::Error);
        assert!(response.data.is_none());
        assert!(response.message.unwrap().contains("byte limit"));
    }
}

#[cfg(test)]
mod tick_tests {
    use super::*;

    #[test]
    fn test_tick_publishes_moisture() {
        let mut agent = agent();

        let report = agent.tick(SensorFeed {
            soil_moisture_percent: Some(70.0),
            npk: None,
        });
        assert_eq!(report.tick, 1);
        assert!(report.moisture_published);
        assert_eq!(report.frames_on_wire, 1);
        assert!(!report.auto_irrigation.triggered());
        assert_eq!(agent.telemetry().metrics().frames_observed, 1);
    }

    #[test]
    fn test_automatic_irrigation_through_ticks() {
        let mut agent = agent();
        agent.irrigation_mut().set_target_moisture(60.0).unwrap();
        agent.irrigation_mut().start(IrrigationMode::Automatic);

        let dry = agent.tick(SensorFeed {
            soil_moisture_percent: Some(45.0),
            npk: None,
        });
        assert!(dry.auto_irrigation.triggered());
        assert_eq!(agent.irrigation().active_zones(), vec![1, 2, 3, 4]);
        // start + 4 valve commands + the moisture reading
        assert_eq!(dry.frames_on_wire, 6);
    }

    #[test]
    fn test_received_readings_are_reported() {
        let mut agent = agent();
        for (kind, value) in [(SensorKind::Temperature, 21.5), (SensorKind::Humidity, 64.0)] {
            agent
                .bus()
                .with(|bus| bus.inject_raw(kind.identifier(), AddressingMode::Standard, &encode_sensor_payload(value)))
                .unwrap();
        }

        let report = agent.tick(SensorFeed::default());
        let kinds: Vec<SensorKind> = report.readings_received.iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![SensorKind::Temperature, SensorKind::Humidity]);
        assert_eq!(report.soil_moisture_percent, None);
        assert!(!report.moisture_published);
    }

    #[test]
    fn test_feed_npk_is_remembered() {
        let mut agent = agent();
        let npk = agribus::actuators::Npk::new(20.0, 10.0, 30.0);
        agent.tick(SensorFeed {
            soil_moisture_percent: None,
            npk: Some(npk),
        });
        agent.tick(SensorFeed::default());
        assert_eq!(agent.last_npk(), Some(npk));
        assert_eq!(agent.tick_count(), 2);
    }

    #[test]
    fn test_automatic_fertilization_advice() {
        let mut agent = agent();
        agent.fertilization_mut().start(FertilizationMode::Automatic);

        let report = agent.tick(SensorFeed {
            soil_moisture_percent: None,
            npk: Some(Npk::new(15.0, 8.0, 25.0)),
        });
        let recommendation = report.recommendation.unwrap();
        assert_eq!(recommendation.product, Some(Product::Npk20_10_10));

        // Advice keeps using the last known levels.
        assert!(agent.tick(SensorFeed::default()).recommendation.is_some());
    }

    #[test]
    fn test_no_advice_outside_automatic_mode() {
        let mut agent = agent();
        agent.fertilization_mut().start(FertilizationMode::Manual);

        let report = agent.tick(SensorFeed {
            soil_moisture_percent: None,
            npk: Some(Npk::new(15.0, 8.0, 25.0)),
        });
        assert!(report.recommendation.is_none());
        assert!(agent.tick(SensorFeed::default()).recommendation.is_none());
    }
}

#[cfg(test)]
mod snapshot_tests {
    use super::*;

    #[test]
    fn test_snapshot_round_trip() {
        let mut agent = agent();
        agent.irrigation_mut().start(IrrigationMode::Manual);
        agent.irrigation_mut().irrigate_zone(1, 2.0).unwrap();
        agent.tick(SensorFeed::default());

        let json = agent.snapshot_json().unwrap();
        let snapshot: FieldSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(snapshot.sequence, 1);
        assert!(snapshot.bus.active);
        assert_eq!(snapshot.irrigation.mode, IrrigationMode::Manual);
        assert_eq!(snapshot.irrigation_statistics.completed_runs, 1);
        assert!(!snapshot.recent_frames.is_empty());

        let mut handler = ProtocolHandler::new();
        let rendered = handler.serialize_snapshot(&snapshot).unwrap();
        let again: FieldSnapshot = serde_json::from_str(rendered).unwrap();
        assert_eq!(again.recent_frames, snapshot.recent_frames);
    }

    #[test]
    fn test_system_status_carries_snapshot() {
        let mut agent = agent();
        let response = send(&mut agent, 1, json!("SystemStatus"));
        let snapshot: FieldSnapshot = serde_json::from_value(response.data.unwrap()).unwrap();
        assert_eq!(snapshot.fertilization.tank_level_percent, 100.0);
        assert_eq!(agent.telemetry().history().len(), 1);
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn test_agent_from_config() {
        let config = FieldConfig::from_json(
            r#"{
                "bus": {"bus_id": "CAN_NORTH", "accept_filter": [259]},
                "irrigation": {"system_id": "IRR_NORTH", "zone_count": 2, "max_flow_rate": 40.0},
                "fertilization": {"tank_capacity_kg": 250.0}
            }"#,
        )
        .unwrap();

        let mut agent = FieldAgent::from_config(&config).unwrap();
        agent.start();

        assert_eq!(agent.bus().lock().bus_id(), "CAN_NORTH");
        assert_eq!(agent.irrigation().system_id(), "IRR_NORTH");
        assert_eq!(agent.irrigation().zone_count(), 2);
        assert_eq!(agent.fertilization().tank_capacity_kg(), 250.0);

        let accepted = agent.bus().with(|bus| {
            bus.inject_raw(0x104, AddressingMode::Standard, &encode_sensor_payload(20.0))
                .unwrap()
        });
        assert!(!accepted);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = FieldConfig::default();
        config.fertilization.tank_capacity_kg = 0.0;
        assert!(FieldAgent::from_config(&config).is_err());
    }
}
