#![no_main]

use libfuzzer_sys::fuzz_target;
use traffic_types::{CauseMapping, Geometry, Incident, IncidentRecord};

fuzz_target!(|data: &[u8]| {
    let Ok(record) = serde_json::from_slice::<IncidentRecord>(data) else {
        return;
    };
    let mapping = CauseMapping::default();
    assert!(!mapping
        .cause_for(record.icon_category_or_unknown())
        .is_empty());
    assert!(record.delay_or_zero() >= 0.0);

    if let Ok(incident) = Incident::from_record(&record) {
        assert!(!incident.id.trim().is_empty());
        assert!(incident.delay.map_or(true, |delay| delay.is_finite() && delay >= 0.0));
        let restored = Geometry::from_stored(
            incident.geometry.kind(),
            &incident.geometry.coordinates_json(),
        )
        .expect("stored geometry must decode");
        assert_eq!(restored, incident.geometry);
    }
});
