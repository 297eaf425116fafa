//! Weight normalization: raw admission rates become routing weights summing
//! to exactly [`TOTAL_WEIGHT`].

use std::collections::{BTreeMap, HashMap};

use super::ServiceState;

/// The fixed sum of all routing weights.
pub const TOTAL_WEIGHT: f64 = 100.0;

/// Normalizes `raw_admission_rate` into `curr_weight` across all services.
///
/// With a utilization snapshot covering every service with a non-zero value,
/// weights are additionally skewed by relative CPU utilization; otherwise
/// (cold start) plain proportional normalization applies. If the total raw
/// rate is zero this is a no-op and previous weights are retained.
pub fn normalize(
    services: &mut BTreeMap<String, ServiceState>,
    total_weight: f64,
    utilization: Option<&HashMap<String, f64>>,
) {
    let total_raw: f64 = services.values().map(|s| s.raw_admission_rate).sum();
    if total_raw <= 0.0 {
        debug!("Total raw admission rate is zero; retaining previous weights.");
        return;
    }

    let mut scaled: Vec<(String, f64)> = services
        .values()
        .map(|s| (s.name.clone(), s.raw_admission_rate * total_weight / total_raw))
        .collect();

    if let Some(utilization) = utilization {
        if let Some(adjusted) = adjust_for_utilization(&scaled, utilization, total_weight) {
            scaled = adjusted;
        }
    }

    distribute(services, scaled, total_weight);
}

/// Skews scaled weights by each service's utilization relative to the fleet
/// average, then rescales so the total is preserved. Returns `None` when any
/// service is missing from the snapshot or reports zero utilization, which
/// marks a cold start.
fn adjust_for_utilization(
    scaled: &[(String, f64)],
    utilization: &HashMap<String, f64>,
    total_weight: f64,
) -> Option<Vec<(String, f64)>> {
    let mut usages = Vec::with_capacity(scaled.len());
    for (name, _) in scaled {
        match utilization.get(name) {
            Some(&usage) if usage > 0.0 => usages.push(usage),
            _ => {
                debug!(
                    message = "Cold start detected; skipping utilization adjustment.",
                    service = %name,
                );
                return None;
            }
        }
    }

    let average = usages.iter().sum::<f64>() / usages.len() as f64;
    let adjusted: Vec<(String, f64)> = scaled
        .iter()
        .zip(usages)
        .map(|((name, weight), usage)| (name.clone(), weight * usage / average))
        .collect();

    // Rescale so the fixed weight sum survives the skew.
    let total: f64 = adjusted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    Some(
        adjusted
            .into_iter()
            .map(|(name, weight)| (name, weight * total_weight / total))
            .collect(),
    )
}

/// Floors the scaled weights and hands out the rounding residual one unit at
/// a time, in descending order of fractional part, ties broken by name.
fn distribute(
    services: &mut BTreeMap<String, ServiceState>,
    scaled: Vec<(String, f64)>,
    total_weight: f64,
) {
    let mut floored: Vec<(String, f64, f64)> = scaled
        .into_iter()
        .map(|(name, value)| {
            let floor = value.floor();
            (name, floor, value - floor)
        })
        .collect();

    let floor_sum: f64 = floored.iter().map(|(_, floor, _)| floor).sum();
    let mut residual = (total_weight - floor_sum).round() as i64;

    floored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .expect("fractional parts are finite")
            .then_with(|| a.0.cmp(&b.0))
    });

    for (name, floor, _) in &mut floored {
        let bump = if residual > 0 {
            residual -= 1;
            1.0
        } else {
            0.0
        };
        if let Some(service) = services.get_mut(name.as_str()) {
            service.curr_weight = *floor + bump;
        }
    }
}
