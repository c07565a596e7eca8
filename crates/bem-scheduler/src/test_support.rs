use std::collections::BTreeMap;

use bem_core::{CellSettings, MonitoringProblemRow, ObjectType, RuleCellConfig, StateType};

pub(crate) fn prod_cell() -> RuleCellConfig {
    RuleCellConfig::new(CellSettings::named("prod"))
}

pub(crate) fn service_row(host: &str, service: &str, state: &str) -> MonitoringProblemRow {
    MonitoringProblemRow {
        id: Some(10),
        object_type: ObjectType::Service,
        host_id: Some(1),
        host_name: host.into(),
        service_name: Some(service.into()),
        state_type: StateType::Hard,
        state: state.into(),
        hard_state: if state == "OK" { 0 } else { 2 },
        is_acknowledged: false,
        is_in_downtime: false,
        output: format!("{service} is {state}"),
        vars: BTreeMap::from([("service.vars.team".to_string(), "web".to_string())]),
        vars_complete: true,
    }
}
