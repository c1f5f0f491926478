use anyhow::Result;
use log::debug;

use crate::manager::PackageManager;
use crate::package::PackageItem;
use crate::runtime::Runtime;

/// List installed packages of one storage root.
#[tracing::instrument(skip(pm))]
pub fn list<R: Runtime>(pm: &PackageManager<R>) -> Result<()> {
    debug!("Listing packages from {:?}", pm.package_dir());
    let packages = pm.get_installed()?;
    print!("{}", render_list(&packages));
    Ok(())
}

pub fn render_list(packages: &[PackageItem]) -> String {
    if packages.is_empty() {
        return "No packages installed.\n".to_string();
    }
    let width = packages
        .iter()
        .filter_map(PackageItem::name)
        .map(str::len)
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for pkg in packages {
        let (Some(name), Some(version)) = (pkg.name(), pkg.version()) else {
            continue;
        };
        let source = pkg
            .spec()
            .and_then(|s| s.uri.clone())
            .map(|uri| format!(" ({})", uri))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<width$} {}{}\n",
            name,
            version,
            source,
            width = width
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{PackageMetadata, PackageSpec, PackageType};
    use semver::Version;
    use std::path::PathBuf;

    fn item(name: &str, version: &str, spec: &str) -> PackageItem {
        PackageItem::new(
            PathBuf::from("/lib").join(name),
            Some(PackageMetadata::new(
                PackageType::Library,
                name,
                Version::parse(version).unwrap(),
                Some(PackageSpec::parse(spec).unwrap()),
            )),
        )
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_list(&[]), "No packages installed.\n");
    }

    #[test]
    fn test_render_aligns_names() {
        let out = render_list(&[
            item("blink", "1.0.0", "alice/blink"),
            item("ws2812", "0.3.1", "https://example.com/ws2812.zip"),
        ]);
        assert_eq!(
            out,
            "blink  1.0.0\nws2812 0.3.1 (https://example.com/ws2812.zip)\n"
        );
    }
}
