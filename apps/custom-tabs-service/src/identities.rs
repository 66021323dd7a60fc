use std::collections::HashMap;

use custom_tabs_core::{ClientIdentity, IdentityResolver, PackageIdentity};
use tracing::debug;

/// uid → package table loaded from configuration. A uid listed with more than
/// one package is a shared uid and resolves to nothing.
#[derive(Debug, Default)]
pub struct PackageTable {
    packages: HashMap<ClientIdentity, Vec<PackageIdentity>>,
}

impl PackageTable {
    pub fn new(entries: &[(u32, String)]) -> Self {
        let mut packages: HashMap<ClientIdentity, Vec<PackageIdentity>> = HashMap::new();
        for (uid, package) in entries {
            let listed = packages.entry(ClientIdentity(*uid)).or_default();
            let package = PackageIdentity::new(package.as_str());
            if !listed.contains(&package) {
                listed.push(package);
            }
        }
        Self { packages }
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl IdentityResolver for PackageTable {
    fn resolve_identity(&self, uid: ClientIdentity) -> Option<PackageIdentity> {
        match self.packages.get(&uid).map(Vec::as_slice) {
            Some([only]) => Some(only.clone()),
            Some(many) => {
                debug!(%uid, packages = many.len(), "uid does not resolve to a single package");
                None
            }
            None => None,
        }
    }
}
