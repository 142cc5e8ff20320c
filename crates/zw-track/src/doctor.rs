use anyhow::Result;
use zw_proto::Zone;

use crate::location::WatchOptions;

pub fn check_gnss_thresholds(min_sats: u8, max_hdop: f32, max_fix_age_s: u64) -> Result<()> {
    anyhow::ensure!(min_sats >= 4, "location.min_sats too low");
    anyhow::ensure!(max_hdop > 0.5 && max_hdop < 20.0, "location.max_hdop out of range");
    anyhow::ensure!(max_fix_age_s >= 1 && max_fix_age_s <= 10, "location.max_fix_age_s should be 1..10");
    Ok(())
}

pub fn check_watch_options(opts: &WatchOptions) -> Result<()> {
    anyhow::ensure!(opts.min_distance_m.is_finite() && opts.min_distance_m >= 0.0, "location.min_distance_m must be >= 0");
    Ok(())
}

pub fn check_zone(zone: &Zone) -> Result<()> {
    let c = &zone.center;
    anyhow::ensure!(!zone.name.trim().is_empty(), "zone {} has no name", zone.id);
    anyhow::ensure!(c.latitude.is_finite() && c.latitude.abs() <= 90.0, "zone {} latitude invalid: {}", zone.id, c.latitude);
    anyhow::ensure!(c.longitude.is_finite() && c.longitude.abs() <= 180.0, "zone {} longitude invalid: {}", zone.id, c.longitude);
    anyhow::ensure!(zone.radius_m.is_finite() && zone.radius_m >= 0.0, "zone {} radius must be >= 0", zone.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zw_proto::Coordinate;

    #[test]
    fn zone_sanity() {
        let ok = Zone::new("a".into(), "home", Coordinate::new(40.4, -3.7), 0.0);
        assert!(check_zone(&ok).is_ok());

        let bad_lat = Zone::new("b".into(), "x", Coordinate::new(91.0, 0.0), 10.0);
        assert!(check_zone(&bad_lat).is_err());
        let bad_radius = Zone::new("c".into(), "x", Coordinate::new(0.0, 0.0), -1.0);
        assert!(check_zone(&bad_radius).is_err());
        let nan = Zone::new("d".into(), "x", Coordinate::new(f64::NAN, 0.0), 1.0);
        assert!(check_zone(&nan).is_err());
        let unnamed = Zone::new("e".into(), " ", Coordinate::new(0.0, 0.0), 1.0);
        assert!(check_zone(&unnamed).is_err());
    }

    #[test]
    fn thresholds() {
        assert!(check_gnss_thresholds(4, 5.0, 5).is_ok());
        assert!(check_gnss_thresholds(3, 5.0, 5).is_err());
        assert!(check_gnss_thresholds(6, 0.2, 5).is_err());
        assert!(check_gnss_thresholds(6, 2.0, 0).is_err());
        assert!(check_watch_options(&WatchOptions::default()).is_ok());
        assert!(check_watch_options(&WatchOptions { high_accuracy: true, min_distance_m: -1.0 }).is_err());
    }
}
