use std::cmp::Ordering;

use log::{debug, warn};

use crate::error::{Result, UpdateError};

/// Fail with [`UpdateError::LauncherOutdated`] when `current` is older than `minimum`.
///
/// An empty minimum places no requirement.
pub fn ensure_launcher_compatible(minimum: &str, current: &str) -> Result<()> {
    let required = normalize_version(minimum);
    if required.is_empty() {
        return Ok(());
    }
    let running = normalize_version(current);
    if compare_versions(&running, &required) == Ordering::Less {
        warn!("launcher_check: running {running}, release requires {required}");
        return Err(UpdateError::LauncherOutdated {
            required,
            current: running,
        });
    }
    debug!("launcher_check: {running} satisfies minimum {required}");
    Ok(())
}

/// Strip a leading `v` and surrounding whitespace.
pub fn normalize_version(version: &str) -> String {
    version.trim().trim_start_matches(['v', 'V']).to_owned()
}

/// Compare dotted versions numerically; missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts_a = parse_version_parts(a);
    let parts_b = parse_version_parts(b);
    let len = parts_a.len().max(parts_b.len());
    (0..len)
        .map(|i| {
            let x = parts_a.get(i).copied().unwrap_or(0);
            let y = parts_b.get(i).copied().unwrap_or(0);
            x.cmp(&y)
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

// "1.4.2-beta.1" -> [1, 4, 2]; stops at the first non-numeric component.
fn parse_version_parts(version: &str) -> Vec<u32> {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    core.split('.')
        .map_while(|part| part.parse::<u32>().ok())
        .collect()
}
