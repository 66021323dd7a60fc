//! Digital Asset Links verification: an origin vouches for a package by listing
//! it in `/.well-known/assetlinks.json`.

use std::time::Duration;

use custom_tabs_core::{
    OriginVerifier, Origin, PackageIdentity, Relation, VerifyCallback, VerifyError,
};
use serde::Deserialize;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::config::AssetLinksMode;

const ANDROID_NAMESPACE: &str = "android_app";

#[derive(Debug, thiserror::Error)]
pub enum AssetLinksError {
    #[error("asset links request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("asset links not published (status {0})")]
    NotPublished(u16),
    #[error("asset links url could not be built: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Statement {
    #[serde(default)]
    pub relation: Vec<String>,
    pub target: Target,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub namespace: String,
    #[serde(default)]
    pub package_name: Option<String>,
}

/// Whether any statement grants `relation` to `package`.
pub fn statements_grant(statements: &[Statement], package: &PackageIdentity, relation: Relation) -> bool {
    let permission = relation.asset_links_permission();
    statements.iter().any(|statement| {
        statement.target.namespace == ANDROID_NAMESPACE
            && statement.target.package_name.as_deref() == Some(package.as_str())
            && statement.relation.iter().any(|r| r == permission)
    })
}

/// Delivers the verification result exactly once. A task dropped before it
/// finishes (runtime shutdown) reports the origin as unavailable.
struct PendingResult {
    on_result: Option<VerifyCallback>,
}

impl PendingResult {
    fn finish(mut self, result: Result<(), VerifyError>) {
        if let Some(on_result) = self.on_result.take() {
            on_result(result);
        }
    }
}

impl Drop for PendingResult {
    fn drop(&mut self) {
        if let Some(on_result) = self.on_result.take() {
            debug!("asset links task dropped before completion");
            on_result(Err(VerifyError::Unavailable("verification task dropped".into())));
        }
    }
}

pub struct AssetLinksVerifier {
    mode: AssetLinksMode,
    client: reqwest::Client,
    runtime: Handle,
}

impl AssetLinksVerifier {
    pub fn new(mode: AssetLinksMode, timeout: Duration, runtime: Handle) -> Result<Self, AssetLinksError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            mode,
            client,
            runtime,
        })
    }

    async fn fetch(client: &reqwest::Client, origin: &Origin) -> Result<Vec<Statement>, AssetLinksError> {
        let url = url::Url::parse(&origin.serialize())?.join("/.well-known/assetlinks.json")?;
        let resp = client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AssetLinksError::NotPublished(status.as_u16()));
        }
        Ok(resp.json().await?)
    }
}

impl OriginVerifier for AssetLinksVerifier {
    fn verify_origin(
        &self,
        package: &PackageIdentity,
        origin: &Origin,
        relation: Relation,
        on_result: VerifyCallback,
    ) {
        if self.mode == AssetLinksMode::Disabled {
            on_result(Err(VerifyError::NotDeclared));
            return;
        }
        let client = self.client.clone();
        let package = package.clone();
        let origin = origin.clone();
        let pending = PendingResult {
            on_result: Some(on_result),
        };
        self.runtime.spawn(async move {
            let result = match Self::fetch(&client, &origin).await {
                Ok(statements) if statements_grant(&statements, &package, relation) => Ok(()),
                Ok(_) => Err(VerifyError::NotDeclared),
                Err(AssetLinksError::NotPublished(status)) => {
                    debug!(%origin, status, "origin publishes no asset links");
                    Err(VerifyError::NotDeclared)
                }
                Err(err) => {
                    warn!(%origin, error = %err, "asset links lookup failed");
                    Err(VerifyError::Unavailable(err.to_string()))
                }
            };
            pending.finish(result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statements() -> Vec<Statement> {
        serde_json::from_str(
            r#"[
                {
                    "relation": ["delegate_permission/common.handle_all_urls"],
                    "target": {"namespace": "android_app", "package_name": "com.example.app",
                               "sha256_cert_fingerprints": ["AA:BB"]}
                },
                {
                    "relation": ["delegate_permission/common.use_as_origin"],
                    "target": {"namespace": "web", "site": "https://a.example"}
                }
            ]"#,
        )
        .expect("statement list")
    }

    #[test_timeout::timeout]
    fn grants_only_the_listed_relation_and_package() {
        let statements = statements();
        let app = PackageIdentity::new("com.example.app");
        assert!(statements_grant(&statements, &app, Relation::HandleAllUrls));
        assert!(!statements_grant(&statements, &app, Relation::UseAsOrigin));
        assert!(!statements_grant(
            &statements,
            &PackageIdentity::new("org.other"),
            Relation::HandleAllUrls
        ));
    }

    #[test_timeout::timeout]
    fn lookup_dropped_with_its_runtime_still_reports() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let verifier = AssetLinksVerifier::new(
            AssetLinksMode::Fetch,
            Duration::from_secs(1),
            runtime.handle().clone(),
        )
        .expect("client");
        let (tx, rx) = std::sync::mpsc::channel();
        verifier.verify_origin(
            &PackageIdentity::new("com.example.app"),
            &Origin::parse("https://a.example").expect("origin"),
            Relation::UseAsOrigin,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        drop(runtime);
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("result");
        assert!(matches!(result, Err(VerifyError::Unavailable(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn disabled_mode_reports_undeclared_without_network() {
        let verifier = AssetLinksVerifier::new(
            AssetLinksMode::Disabled,
            Duration::from_secs(1),
            Handle::current(),
        )
        .expect("client");
        let (tx, rx) = std::sync::mpsc::channel();
        verifier.verify_origin(
            &PackageIdentity::new("com.example.app"),
            &Origin::parse("https://a.example").expect("origin"),
            Relation::UseAsOrigin,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert_eq!(rx.recv().expect("result"), Err(VerifyError::NotDeclared));
    }
}
