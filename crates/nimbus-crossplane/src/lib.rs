//! Crossplane subsystem
//!
//! Installs Crossplane, activates the provider packages the enabled
//! add-ons need, wires ProviderConfigs to credential secrets and
//! applies the composite resources, waiting for each composition to
//! come up Ready. The whole sequence is idempotent: re-running against
//! a cluster where it already succeeded only re-applies.

pub mod error;

pub use error::{CrossplaneError, Result};

use minijinja::context;
use nimbus_common::descriptor::KeosCluster;
use nimbus_exec::{ExecError, ExecOpts, NodeRunner};
use nimbus_provider::{PrivateParams, Provider};
use nimbus_render::Renderer;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

const CROSSPLANE_DIR: &str = "/kind/crossplane";
const NAMESPACE: &str = "crossplane-system";

/// One Crossplane installation run, against the bootstrap cluster
/// (`kubeconfig: None`) or the workload cluster.
pub struct CrossplaneRun<'a> {
    pub node: &'a dyn NodeRunner,
    pub renderer: &'a Renderer,
    pub provider: &'a dyn Provider,
    pub cluster: &'a KeosCluster,
    pub private: &'a PrivateParams,
    pub kubeconfig: Option<&'a str>,
    pub addons: Vec<String>,
    pub custom_params: BTreeMap<String, String>,
    /// Settle time before patching provider deployments in private
    /// mode. Tests shrink this.
    pub settle: Duration,
}

impl<'a> CrossplaneRun<'a> {
    fn kubeconfig_arg(&self) -> String {
        match self.kubeconfig {
            Some(path) => format!(" --kubeconfig {path}"),
            None => String::new(),
        }
    }

    /// Run a create-style command, treating "already exists" as success.
    async fn create_tolerating_exists(&self, cmd: &str) -> Result<()> {
        match self.node.exec(cmd, ExecOpts::default()).await {
            Ok(_) => Ok(()),
            Err(ExecError::ExecFailed { stderr, .. })
                if stderr.contains("AlreadyExists") || stderr.contains("already exists") =>
            {
                debug!(cmd, "object already exists, continuing");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Phase A: namespace, egress policy, chart, rollout waits.
    async fn install_core(&self) -> Result<()> {
        let kc = self.kubeconfig_arg();
        self.node
            .exec(
                &format!("mkdir -p {CROSSPLANE_DIR} && chmod -R 0755 {CROSSPLANE_DIR}"),
                ExecOpts::default(),
            )
            .await?;
        self.create_tolerating_exists(&format!("kubectl create ns {NAMESPACE}{kc}"))
            .await?;

        if let Some(kubeconfig) = self.kubeconfig {
            let netpol = self.renderer.raw("common", "crossplane-egress_netpol.yaml")?;
            self.node
                .pipe(
                    &["kubectl", "--kubeconfig", kubeconfig, "apply", "-f", "-"],
                    &netpol,
                )
                .await?;
        }

        let mut cmd = format!("helm install crossplane /stratio/helm/crossplane --namespace {NAMESPACE}");
        if self.private.private {
            cmd.push_str(&format!(
                " --set image.repository={}/crossplane/crossplane",
                self.private.keos_reg_url
            ));
        }
        if self.kubeconfig.is_some() {
            cmd.push_str(&kc);
            cmd.push_str(" --set replicas=2 --set rbacManager.replicas=2");
        }
        self.node.exec(&cmd, ExecOpts::default()).await?;

        for deploy in ["crossplane", "crossplane-rbac-manager"] {
            self.node
                .exec(
                    &format!(
                        "kubectl -n {NAMESPACE} rollout status deploy {deploy} --timeout=3m{kc}"
                    ),
                    ExecOpts::default(),
                )
                .await?;
        }
        Ok(())
    }

    /// Phase B: provider packages.
    async fn install_providers(&self) -> Result<()> {
        let kc = self.kubeconfig_arg();
        let providers = self.provider.crossplane_providers(&self.addons);
        for (pkg, version) in &providers {
            let image = if self.private.private {
                format!("{}/upbound/{pkg}:{version}", self.private.keos_reg_url)
            } else {
                format!("xpkg.upbound.io/upbound/{pkg}:{version}")
            };
            let manifest = self.renderer.render(
                "common",
                "crossplane-provider.tmpl",
                context! {
                    provider => pkg,
                    image => image,
                    private => self.private.private,
                },
            )?;
            let file = format!("{CROSSPLANE_DIR}/{pkg}.yaml");
            self.node.pipe(&["tee", &file], &manifest).await?;
            self.create_tolerating_exists(&format!("kubectl create -f {file}{kc}"))
                .await?;
            self.node
                .exec(
                    &format!(
                        "kubectl wait providers.pkg.crossplane.io/{pkg} --for=condition=healthy=True --timeout=5m{kc}"
                    ),
                    ExecOpts::default(),
                )
                .await?;

            if self.private.private {
                // Give the package-runtime pod time to exist before the patch.
                tokio::time::sleep(self.settle).await;
                self.node
                    .exec(
                        &format!(
                            "kubectl patch deploy -n {NAMESPACE} {pkg} -p '{{\"spec\": {{\"template\": {{\"spec\":{{\"containers\":[{{\"name\":\"package-runtime\",\"imagePullPolicy\":\"IfNotPresent\"}}]}}}}}}}}'{kc}"
                        ),
                        ExecOpts::default(),
                    )
                    .await?;
            }
            info!(package = %pkg, "crossplane provider healthy");
        }
        Ok(())
    }

    /// Phases C and D for one add-on: ProviderConfig then composites.
    async fn configure_addon(&self, addon: &str) -> Result<()> {
        let kc = self.kubeconfig_arg();
        let capx = self.provider.view().capx_provider;

        let (creds, dedicated) = self.provider.provider_config_content(addon)?;
        let creds_file = format!("{CROSSPLANE_DIR}/{addon}-provider-creds.txt");
        self.node.pipe(&["tee", &creds_file], &creds).await?;

        let secret = if dedicated {
            format!("{capx}-{addon}-secret")
        } else {
            format!("{capx}-crossplane-secret")
        };
        self.create_tolerating_exists(&format!(
            "kubectl create secret generic {secret} -n {NAMESPACE} --from-file=creds={creds_file}{kc}"
        ))
        .await?;

        let project_id = match &self.custom_params.get("projectId") {
            Some(id) => (*id).clone(),
            None => String::new(),
        };
        let config = self.renderer.render(
            capx,
            "crossplane-provider-config.tmpl",
            context! {
                addon => format!("{addon}-provider"),
                secret => secret,
                project_id => project_id,
                subscription_id => self.custom_params.get("subscriptionId").cloned().unwrap_or_default(),
                tenant_id => self.custom_params.get("tenantId").cloned().unwrap_or_default(),
            },
        )?;
        let config_file = format!("{CROSSPLANE_DIR}/{addon}-provider-config.yaml");
        self.node.pipe(&["tee", &config_file], &config).await?;
        self.create_tolerating_exists(&format!("kubectl create -f {config_file}{kc}"))
            .await?;

        let (manifests, waits) = self
            .provider
            .crossplane_cr_manifests(self.cluster, addon, &self.custom_params)
            .await?;
        for (i, manifest) in manifests.iter().enumerate() {
            let file = format!("{CROSSPLANE_DIR}/{addon}-{i}.yaml");
            self.node.pipe(&["tee", &file], manifest).await?;
            self.create_tolerating_exists(&format!("kubectl create -f {file}{kc}"))
                .await?;
        }
        for (kind, name) in &waits {
            self.node
                .exec(
                    &format!("kubectl wait {kind}/{name} --for=condition=ready --timeout=10m{kc}"),
                    ExecOpts::default(),
                )
                .await?;
            info!(kind = %kind, name = %name, "composition ready");
        }
        Ok(())
    }

    /// The whole sequence: install, providers, one config per add-on.
    pub async fn run(&self) -> Result<()> {
        if self.addons.is_empty() {
            debug!("no crossplane add-ons enabled, skipping");
            return Ok(());
        }
        self.install_core().await?;
        self.install_providers().await?;
        for addon in &self.addons {
            self.configure_addon(addon).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_common::KeosCluster;
    use nimbus_exec::ScriptedRunner;
    use nimbus_provider::aws::AwsProvider;
    use nimbus_vault::{CloudCreds, CredentialsBundle};
    use std::sync::Arc;

    const DESCRIPTOR: &str = r#"
apiVersion: installer.keos.stratio.com/v1beta1
kind: KeosCluster
metadata:
  name: demo
spec:
  infra_provider: aws
  k8s_version: v1.26.8
  region: eu-west-1
  external_domain: demo.example.com
  networks:
    vpc_id: vpc-123
  docker_registries:
    - url: registry.example.com/keos
      keos_registry: true
  control_plane:
    managed: false
    size: m5.xlarge
  worker_nodes:
    - name: workers
      quantity: 3
      size: t3.large
"#;

    fn bundle() -> Arc<CredentialsBundle> {
        Arc::new(CredentialsBundle {
            provider: CloudCreds::Aws(nimbus_common::AwsCredentials {
                access_key: "AKIA".to_string(),
                secret_key: "SECRET".to_string(),
                account: "123456789012".to_string(),
                region: None,
            }),
            github_token: None,
            keos_registry: nimbus_common::RegistryCredentials {
                url: "registry.example.com/keos".to_string(),
                user: "keos".to_string(),
                pass: "pass".to_string(),
            },
            docker_registries: vec![],
            crossplane: None,
            external_dns: None,
        })
    }

    fn run_against(runner: &ScriptedRunner, private: bool) {
        let cluster = KeosCluster::from_yaml(DESCRIPTOR).unwrap();
        let renderer = Renderer::new();
        let provider = AwsProvider::new(
            &cluster,
            bundle(),
            Arc::new(Renderer::new()),
            false,
        )
        .unwrap();
        let private = PrivateParams {
            private,
            keos_reg_url: "registry.example.com/keos".to_string(),
        };
        let run = CrossplaneRun {
            node: runner,
            renderer: &renderer,
            provider: &provider,
            cluster: &cluster,
            private: &private,
            kubeconfig: None,
            addons: vec!["external-dns".to_string()],
            custom_params: BTreeMap::new(),
            settle: Duration::from_millis(0),
        };
        tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(run.run())
            .unwrap();
    }

    #[test]
    fn test_full_sequence_on_bootstrap() {
        let runner = ScriptedRunner::new();
        run_against(&runner, false);
        assert!(runner.saw("kubectl create ns crossplane-system"));
        assert!(runner.saw("helm install crossplane /stratio/helm/crossplane"));
        assert!(runner.saw("rollout status deploy crossplane-rbac-manager"));
        assert!(runner.saw("providers.pkg.crossplane.io/provider-family-aws"));
        assert!(runner.saw("providers.pkg.crossplane.io/provider-aws-route53"));
        assert!(runner.saw("kubectl wait xZonesConfig/demo-zones-config --for=condition=ready --timeout=10m"));
        // Shared crossplane secret: no dedicated external-dns credentials.
        assert!(runner.saw("create secret generic aws-crossplane-secret"));
    }

    #[test]
    fn test_private_mode_patches_package_runtime() {
        let runner = ScriptedRunner::new();
        run_against(&runner, true);
        assert!(runner.saw("image.repository=registry.example.com/keos/crossplane/crossplane"));
        assert!(runner.saw("imagePullPolicy"));
    }

    #[test]
    fn test_already_exists_is_tolerated() {
        let runner = ScriptedRunner::new()
            .fail_on("create ns crossplane-system", "namespaces \"crossplane-system\" already exists (AlreadyExists)");
        run_against(&runner, false);
    }
}
