use anyhow::Result;
use log::{debug, warn};
use std::collections::HashSet;

use crate::manager::PackageManager;
use crate::package::{PackageOutdatedResult, PackageSpec};
use crate::runtime::Runtime;

/// Update the named packages, or every installed one when `specs` is empty.
///
/// A requirement on a user spec becomes the update target; the installed
/// package itself is looked up without it.
#[tracing::instrument(skip(pm))]
pub async fn update<R: Runtime>(
    pm: &PackageManager<R>,
    specs: &[String],
    skip_dependencies: bool,
) -> Result<()> {
    let mut targets: Vec<(PackageSpec, Option<PackageSpec>)> = Vec::new();
    if specs.is_empty() {
        let mut seen = HashSet::new();
        for pkg in pm.get_installed()? {
            let Some(spec) = pkg.spec() else { continue };
            let lookup = spec.clone().with_requirements(None);
            if seen.insert(lookup.clone()) {
                targets.push((lookup, None));
            }
        }
    } else {
        for raw in specs {
            let spec = PackageSpec::parse(raw)?;
            let to_spec = spec.requirements.is_some().then(|| spec.clone());
            targets.push((spec.with_requirements(None), to_spec));
        }
    }

    if targets.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }
    for (from_spec, to_spec) in targets {
        debug!("Checking {} for updates", from_spec);
        let before = pm.get_package(&from_spec)?.and_then(|p| p.version().cloned());
        let pkg = match pm.update(&from_spec, to_spec.as_ref(), skip_dependencies).await {
            Ok(pkg) => pkg,
            Err(e) if specs.is_empty() => {
                warn!("Could not update {}: {}", from_spec, e);
                continue;
            }
            Err(e) => return Err(e),
        };
        if pkg.version() == before.as_ref() {
            println!("{} is up to date", pkg);
        } else {
            println!("Updated {}", pkg);
        }
    }
    Ok(())
}

/// Print the outdated state of every installed package.
#[tracing::instrument(skip(pm))]
pub async fn outdated<R: Runtime>(pm: &PackageManager<R>) -> Result<()> {
    let packages = pm.get_installed()?;
    if packages.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }
    for pkg in packages {
        let Some(name) = pkg.name() else { continue };
        let result = match pm.outdated(&pkg, None).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Could not check {}: {}", name, e);
                continue;
            }
        };
        println!("{}", render_outdated(name, &result));
    }
    Ok(())
}

fn render_outdated(name: &str, result: &PackageOutdatedResult) -> String {
    let show = |v: &Option<semver::Version>| {
        v.as_ref().map_or_else(|| "-".to_string(), ToString::to_string)
    };
    let status = if result.detached {
        "detached".to_string()
    } else if result.is_outdated(true) {
        match result.update_increment_type() {
            Some(increment) => format!("{} update", increment),
            None => "outdated".to_string(),
        }
    } else {
        "up to date".to_string()
    };
    format!(
        "{} {} -> {} ({})",
        name,
        show(&result.current),
        show(&result.latest),
        status
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn v(s: &str) -> Option<Version> {
        Some(Version::parse(s).unwrap())
    }

    #[test]
    fn test_render_outdated_minor() {
        let result = PackageOutdatedResult {
            current: v("1.0.0"),
            latest: v("1.2.0"),
            ..Default::default()
        };
        assert_eq!(
            render_outdated("blink", &result),
            "blink 1.0.0 -> 1.2.0 (minor update)"
        );
    }

    #[test]
    fn test_render_outdated_up_to_date() {
        let result = PackageOutdatedResult {
            current: v("1.0.0"),
            latest: v("1.0.0"),
            ..Default::default()
        };
        assert_eq!(
            render_outdated("blink", &result),
            "blink 1.0.0 -> 1.0.0 (up to date)"
        );
    }

    #[test]
    fn test_render_outdated_detached_without_latest() {
        let result = PackageOutdatedResult {
            current: v("0.9.0"),
            detached: true,
            ..Default::default()
        };
        assert_eq!(
            render_outdated("blink", &result),
            "blink 0.9.0 -> - (detached)"
        );
    }
}
