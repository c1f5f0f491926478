use anyhow::Result;
use log::debug;

use crate::manager::PackageManager;
use crate::package::PackageSpec;
use crate::runtime::Runtime;

#[tracing::instrument(skip(pm))]
pub async fn install<R: Runtime>(
    pm: &PackageManager<R>,
    specs: &[String],
    skip_dependencies: bool,
    force: bool,
) -> Result<()> {
    for raw in specs {
        let spec = PackageSpec::parse(raw)?;
        debug!("Installing {:?}", spec);
        let pkg = pm.install(&spec, skip_dependencies, force).await?;
        println!("Installed {} to {}", pkg, pkg.path.display());
    }
    Ok(())
}

#[tracing::instrument(skip(pm))]
pub fn uninstall<R: Runtime>(
    pm: &PackageManager<R>,
    specs: &[String],
    skip_dependencies: bool,
) -> Result<()> {
    for raw in specs {
        let spec = PackageSpec::parse(raw)?;
        let pkg = pm.uninstall(&spec, skip_dependencies)?;
        println!("Removed {}", pkg);
    }
    Ok(())
}
