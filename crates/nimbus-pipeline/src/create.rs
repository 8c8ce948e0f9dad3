//! Create pipeline
//!
//! The ordered state machine that takes a validated descriptor to a
//! self-managed workload cluster: CAPx on the bootstrap node, cluster
//! creation through the cluster-operator, add-on installation, GitOps
//! reconciliation, and finally the pivot of the Cluster-API objects
//! into the cluster they describe. Every phase is atomic from the
//! operator's point of view and failures surface the phase name.

use crate::error::{PipelineError, Result};
use crate::state::PipelineState;
use crate::status::StatusReporter;
use minijinja::context;
use nimbus_charts::{helm, ChartInventory, HelmRegistry, InventoryParams};
use nimbus_common::descriptor::{InfraProvider, InlineCredentials, KeosCluster};
use nimbus_common::validation;
use nimbus_crossplane::CrossplaneRun;
use nimbus_exec::{ExecError, ExecOpts, NodeRunner};
use nimbus_provider::aws::oidc_provider_id;
use nimbus_provider::{build_provider, PrivateParams, Provider};
use nimbus_render::Renderer;
use nimbus_vault::{ensure_secrets_file, strip_descriptor_credentials, CredentialsBundle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const KUBECONFIG_PATH: &str = "/kind/worker-cluster.kubeconfig";
pub const WORK_KUBECONFIG_PATH: &str = ".kube/config";
pub const CAPI_LOCAL_REPOSITORY: &str = "/root/.cluster-api/local-repository";
pub const CLUSTERCTL_CONFIG_PATH: &str = "/root/.cluster-api/clusterctl.yaml";
pub const MANIFESTS_DIR: &str = "/kind/manifests";
pub const BACKUP_OBJECTS_DIR: &str = "/kind/backup/objects";
pub const LOCAL_BACKUP_DIR: &str = "backup";
pub const EGRESS_NETPOL_PATH: &str = "/kind/allow-all-egress_netpol.yaml";
pub const OPERATOR_VALUES_PATH: &str = "/kind/cluster-operator-values.yaml";

// Phase labels, in pipeline order.
pub const P_VALIDATE: &str = "Validating the descriptor";
pub const P_CHARTS: &str = "Pulling initial Helm charts";
pub const P_CAPX_LOCAL: &str = "Installing CAPx locally";
pub const P_MANIFESTS: &str = "Generating workload cluster manifests";
pub const P_IAM: &str = "Ensuring IAM security";
pub const P_CREATE: &str = "Creating the workload cluster";
pub const P_KUBECONFIG: &str = "Saving the workload cluster kubeconfig";
pub const P_PREPARE: &str = "Preparing the workload cluster";
pub const P_NODES: &str = "Waiting for the worker nodes";
pub const P_CROSSPLANE: &str = "Configuring Crossplane add-ons";
pub const P_CAPX_WORKLOAD: &str = "Installing CAPx in workload cluster";
pub const P_FLUX: &str = "Installing Flux and reconciling charts";
pub const P_SELF_HEALING: &str = "Enabling self-healing";
pub const P_NETPOL: &str = "Applying global network policies";
pub const P_STORAGE: &str = "Installing StorageClass";
pub const P_AUTOSCALER: &str = "Installing cluster-autoscaler";
pub const P_OPERATOR: &str = "Installing cluster-operator in workload cluster";
pub const P_CROSSPLANE_WORKLOAD: &str = "Configuring Crossplane add-ons in workload cluster";
pub const P_POST_INSTALL: &str = "Running provider post-install";
pub const P_BACKUP: &str = "Creating objects backup";
pub const P_MOVE: &str = "Moving the management role";
pub const P_KEOS: &str = "Generating the KEOS descriptor";

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub descriptor_path: PathBuf,
    pub secrets_path: PathBuf,
    pub vault_password: String,
    /// Generate manifests and stop before touching the cloud.
    pub avoid_creation: bool,
    /// Leave the management objects on the bootstrap cluster.
    pub keep_mgmt: bool,
    /// Where local artifacts (KEOS descriptor, backups) land.
    pub local_output: PathBuf,
    /// Pin the cluster-operator chart version instead of asking the
    /// repository (offline installs).
    pub operator_version: Option<String>,
    /// Settle time for private-registry provider patches.
    pub crossplane_settle: Duration,
}

impl CreateOptions {
    pub fn new(descriptor_path: impl Into<PathBuf>, vault_password: impl Into<String>) -> Self {
        Self {
            descriptor_path: descriptor_path.into(),
            secrets_path: PathBuf::from("secrets.yml"),
            vault_password: vault_password.into(),
            avoid_creation: false,
            keep_mgmt: false,
            local_output: PathBuf::from("."),
            operator_version: None,
            crossplane_settle: Duration::from_secs(40),
        }
    }
}

/// Everything the phases share once the prepare phase has run.
struct RunCtx {
    cluster: KeosCluster,
    bundle: Arc<CredentialsBundle>,
    provider: Box<dyn Provider>,
    inventory: ChartInventory,
    registry: HelmRegistry,
    private: PrivateParams,
}

impl RunCtx {
    fn capi_namespace(&self) -> String {
        self.cluster.capi_namespace()
    }

    fn name(&self) -> &str {
        &self.cluster.metadata.name
    }
}

pub struct CreatePipeline {
    node: Arc<dyn NodeRunner>,
    renderer: Arc<Renderer>,
    status: StatusReporter,
    options: CreateOptions,
}

impl CreatePipeline {
    pub fn new(
        node: Arc<dyn NodeRunner>,
        status: StatusReporter,
        options: CreateOptions,
    ) -> Self {
        Self {
            node,
            renderer: Arc::new(Renderer::new()),
            status,
            options,
        }
    }

    async fn exec(&self, phase: &'static str, cmd: &str) -> Result<String> {
        self.node
            .exec(cmd, ExecOpts::default())
            .await
            .map_err(|e| PipelineError::exec(phase, e))
    }

    async fn exec_env(&self, phase: &'static str, cmd: &str, env: &[String]) -> Result<String> {
        self.node
            .exec_env(cmd, ExecOpts::default(), env)
            .await
            .map_err(|e| PipelineError::exec(phase, e))
    }

    async fn pipe(&self, phase: &'static str, argv: &[&str], stdin: &str) -> Result<String> {
        self.node
            .pipe(argv, stdin)
            .await
            .map_err(|e| PipelineError::exec(phase, e))
    }

    /// Run a `kubectl wait`-style command; exhausting it is a timeout,
    /// not a command failure.
    async fn wait_for(&self, phase: &'static str, resource: &str, cmd: &str) -> Result<()> {
        match self.node.exec(cmd, ExecOpts::default()).await {
            Ok(_) => Ok(()),
            Err(ExecError::ExecFailed { .. }) => Err(PipelineError::Timeout {
                phase,
                resource: resource.to_string(),
            }),
            Err(e) => Err(PipelineError::exec(phase, e)),
        }
    }

    async fn apply_file(
        &self,
        phase: &'static str,
        kubeconfig: Option<&str>,
        manifest: &str,
    ) -> Result<()> {
        let mut argv = vec!["kubectl"];
        if let Some(kc) = kubeconfig {
            argv.extend(["--kubeconfig", kc]);
        }
        argv.extend(["apply", "-f", "-"]);
        self.pipe(phase, &argv, manifest).await?;
        Ok(())
    }

    /// The full create flow.
    pub async fn run(&self) -> Result<PipelineState> {
        let mut state = PipelineState::new();

        // Phase 1: descriptor, secrets, provider view.
        let guard = self.status.start(P_VALIDATE);
        let mut ctx = self.prepare().await?;
        guard.succeed();
        state.complete(P_VALIDATE);

        // Phase 2: chart catalog and initial pulls.
        let guard = self.status.start(P_CHARTS);
        let version = self.pull_charts(&mut ctx).await?;
        state.operator_version = Some(version);
        guard.succeed();
        state.complete(P_CHARTS);
        let ctx = ctx;

        // Phase 3: CAPx on the bootstrap cluster.
        let guard = self.status.start(P_CAPX_LOCAL);
        self.install_capx(&ctx, None, P_CAPX_LOCAL).await?;
        guard.succeed();
        state.complete(P_CAPX_LOCAL);

        // Phase 4a: manifests, secrets file, operator values.
        let guard = self.status.start(P_MANIFESTS);
        self.generate_manifests(&ctx, &mut state).await?;
        guard.succeed();
        state.complete(P_MANIFESTS);

        if self.options.avoid_creation {
            info!("--avoid-creation: skipping cluster creation");
            self.emit_keos_descriptor(&ctx).await?;
            state.complete(P_KEOS);
            return Ok(state);
        }

        // Phase 4b: provider IAM prerequisites.
        let guard = self.status.start(P_IAM);
        ctx.provider
            .ensure_iam(self.node.as_ref(), &ctx.cluster)
            .await
            .map_err(|e| PipelineError::provider(P_IAM, e))?;
        guard.succeed();
        state.complete(P_IAM);

        // Phase 4c: the cluster itself.
        let guard = self.status.start(P_CREATE);
        self.create_cluster(&ctx, &state).await?;
        guard.succeed();
        state.complete(P_CREATE);

        // Phase 5: kubeconfig.
        let guard = self.status.start(P_KUBECONFIG);
        self.save_kubeconfig(&ctx, &mut state).await?;
        guard.succeed();
        state.complete(P_KUBECONFIG);

        // Phase 6: CNI, cloud-provider, CSI, provider quirks.
        let guard = self.status.start(P_PREPARE);
        self.prepare_workload(&ctx).await?;
        guard.succeed();
        state.complete(P_PREPARE);

        // Phase 7: node readiness.
        let guard = self.status.start(P_NODES);
        self.wait_nodes(&ctx).await?;
        guard.succeed();
        state.complete(P_NODES);

        // Phase 7b: Crossplane on the bootstrap cluster.
        let guard = self.status.start(P_CROSSPLANE);
        self.run_crossplane(&ctx, None, &mut state).await?;
        guard.succeed();
        state.complete(P_CROSSPLANE);

        // Phase 8: CAPx in the workload cluster.
        let guard = self.status.start(P_CAPX_WORKLOAD);
        self.install_capx(&ctx, Some(KUBECONFIG_PATH), P_CAPX_WORKLOAD)
            .await?;
        self.harden_capx_namespaces(&ctx).await?;
        guard.succeed();
        state.complete(P_CAPX_WORKLOAD);

        // Phase 9: GitOps reconciliation.
        let guard = self.status.start(P_FLUX);
        self.install_flux(&ctx).await?;
        guard.succeed();
        state.complete(P_FLUX);

        // Phase 10: self-healing.
        let guard = self.status.start(P_SELF_HEALING);
        self.enable_self_healing(&ctx).await?;
        guard.succeed();
        state.complete(P_SELF_HEALING);

        // Phase 11: global network policies.
        let guard = self.status.start(P_NETPOL);
        self.apply_global_netpols(&ctx).await?;
        guard.succeed();
        state.complete(P_NETPOL);

        // Phase 12: default StorageClass.
        let guard = self.status.start(P_STORAGE);
        ctx.provider
            .configure_storage_class(self.node.as_ref(), KUBECONFIG_PATH)
            .await
            .map_err(|e| PipelineError::provider(P_STORAGE, e))?;
        guard.succeed();
        state.complete(P_STORAGE);

        // Phase 13: cluster-autoscaler.
        let guard = self.status.start(P_AUTOSCALER);
        self.install_autoscaler(&ctx).await?;
        guard.succeed();
        state.complete(P_AUTOSCALER);

        // Phase 14: cluster-operator in the workload cluster.
        let guard = self.status.start(P_OPERATOR);
        self.install_workload_operator(&ctx).await?;
        guard.succeed();
        state.complete(P_OPERATOR);

        // Phase 14b: Crossplane against the workload cluster.
        let guard = self.status.start(P_CROSSPLANE_WORKLOAD);
        self.run_crossplane(&ctx, Some(KUBECONFIG_PATH), &mut state)
            .await?;
        guard.succeed();
        state.complete(P_CROSSPLANE_WORKLOAD);

        // Phase 15: provider polish.
        let guard = self.status.start(P_POST_INSTALL);
        ctx.provider
            .post_install(self.node.as_ref(), KUBECONFIG_PATH)
            .await
            .map_err(|e| PipelineError::provider(P_POST_INSTALL, e))?;
        guard.succeed();
        state.complete(P_POST_INSTALL);

        // Phase 16: backup precedes the pivot, always.
        let guard = self.status.start(P_BACKUP);
        self.backup(&ctx).await?;
        guard.succeed();
        state.complete(P_BACKUP);

        // Phase 17: the pivot.
        if !self.options.keep_mgmt {
            let guard = self.status.start(P_MOVE);
            self.move_management(&ctx).await?;
            guard.succeed();
            state.complete(P_MOVE);
        } else {
            info!("--keep-mgmt: management stays on the bootstrap cluster");
        }

        // Phase 18: local artifacts.
        let guard = self.status.start(P_KEOS);
        self.emit_keos_descriptor(&ctx).await?;
        guard.succeed();
        state.complete(P_KEOS);

        Ok(state)
    }

    async fn prepare(&self) -> Result<RunCtx> {
        let cluster = KeosCluster::load(&self.options.descriptor_path)?;
        validation::validate(&cluster)?;

        let bundle = Arc::new(CredentialsBundle::load(
            &cluster,
            &self.options.secrets_path,
            &self.options.vault_password,
        )?);
        ensure_secrets_file(&cluster, &self.options.secrets_path, &self.options.vault_password)?;
        strip_descriptor_credentials(&cluster, &self.options.descriptor_path)?;

        let provider = build_provider(&cluster, bundle.clone(), self.renderer.clone())
            .map_err(|e| PipelineError::provider(P_VALIDATE, e))?;

        let keos_registry_url = cluster
            .keos_registry()
            .map(|r| r.url.clone())
            .unwrap_or_default();
        let private = PrivateParams {
            private: cluster
                .spec
                .cluster_config
                .as_ref()
                .and_then(|c| c.private_registry)
                .unwrap_or(cluster.spec.fully_private),
            keos_reg_url: keos_registry_url.clone(),
        };
        let registry = HelmRegistry {
            url: if keos_registry_url.starts_with("http") {
                keos_registry_url
            } else {
                format!("oci://{keos_registry_url}")
            },
            user: bundle.keos_registry.user.clone(),
            pass: bundle.keos_registry.pass.clone(),
        };

        let inventory = ChartInventory::for_cluster(&InventoryParams {
            capx_provider: provider.view().capx_provider,
            managed: provider.view().managed,
            deploy_autoscaler: cluster.spec.deploy_autoscaler,
            eks_lb_controller: cluster
                .spec
                .cluster_config
                .as_ref()
                .map(|c| c.eks_lb_controller)
                .unwrap_or(false),
            cluster_operator_version: "latest",
        });
        inventory
            .validate()
            .map_err(|e| PipelineError::chart(P_VALIDATE, e))?;

        Ok(RunCtx {
            cluster,
            bundle,
            provider,
            inventory,
            registry,
            private,
        })
    }

    async fn pull_charts(&self, ctx: &mut RunCtx) -> Result<String> {
        helm::login(self.node.as_ref(), &ctx.registry)
            .await
            .map_err(|e| PipelineError::chart(P_CHARTS, e))?;

        let version = match &self.options.operator_version {
            Some(pinned) => {
                info!(version = %pinned, "cluster-operator chart version pinned");
                pinned.clone()
            }
            None => {
                let version = nimbus_charts::latest_chart_version(&ctx.registry)
                    .await
                    .map_err(|e| PipelineError::chart(P_CHARTS, e))?;
                info!(version = %version, "cluster-operator chart selected from catalog");
                version
            }
        };
        ctx.inventory.set_version("cluster-operator", &version);

        let refs: Vec<_> = ctx.inventory.charts().iter().collect();
        helm::pull_charts(self.node.as_ref(), &ctx.registry, &refs)
            .await
            .map_err(|e| PipelineError::chart(P_CHARTS, e))?;
        Ok(version)
    }

    /// Shared by phase 3 (bootstrap) and phase 8 (workload).
    async fn install_capx(
        &self,
        ctx: &RunCtx,
        kubeconfig: Option<&str>,
        phase: &'static str,
    ) -> Result<()> {
        let view = ctx.provider.view();
        let kc_flag = kubeconfig.map(|k| format!(" --kubeconfig {k}")).unwrap_or_default();
        let capx_ns = view.capx_namespace();

        if ctx.private.private || view.capx_version != view.capx_image_version {
            let (user, pass) = ctx
                .provider
                .registry_credentials(&ctx.private.keos_reg_url)
                .await
                .map_err(|e| PipelineError::provider(phase, e))?;

            for ns in ["cluster-api", capx_ns.as_str()] {
                self.create_tolerating_exists(phase, &format!("kubectl create namespace {ns}{kc_flag}"))
                    .await?;
                self.create_tolerating_exists(
                    phase,
                    &format!(
                        "kubectl create secret docker-registry regcred \
                         --docker-server={} --docker-username={user} --docker-password={pass} \
                         --namespace={ns}{kc_flag}",
                        ctx.private.keos_reg_url
                    ),
                )
                .await?;
            }
        }

        if view.capx_version != view.capx_image_version {
            let components = format!(
                "{CAPI_LOCAL_REPOSITORY}/infrastructure-{}/{}/infrastructure-components.yaml",
                view.capx_provider, view.capx_version
            );
            let image = format!(
                "{}/stratio/cluster-api-provider-{}:{}",
                ctx.private.keos_reg_url, view.capx_provider, view.capx_image_version
            );
            self.exec(phase, &format!("sed -i 's%image:.*%image: {image}%' {components}"))
                .await?;
            self.exec(
                phase,
                &format!(
                    "sed -i '/containers:/i\\      imagePullSecrets:\\n      - name: regcred' {components}"
                ),
            )
            .await?;
        }

        // cert-manager before clusterctl, it is a CAPI prerequisite.
        let mut cert_manager = nimbus_charts::InstallSpec::new("cert-manager", "cert-manager", "cert-manager")
            .create_namespace()
            .set("installCRDs", "true");
        if let Some(kc) = kubeconfig {
            cert_manager = cert_manager.kubeconfig(kc);
        }
        if ctx.private.private {
            cert_manager = cert_manager.set(
                "image.repository",
                &format!("{}/jetstack/cert-manager-controller", ctx.private.keos_reg_url),
            );
        }
        self.exec(phase, &cert_manager.command()).await?;

        let mut init = format!(
            "clusterctl init --wait-providers -i {}:{}",
            view.capx_provider, view.capx_version
        );
        if ctx.private.private {
            let overrides = self
                .renderer
                .render(
                    "common",
                    "clusterctl-config.tmpl",
                    context! {
                        registry => &ctx.private.keos_reg_url,
                        capx_provider => view.capx_provider,
                    },
                )
                .map_err(|e| PipelineError::render(phase, e))?;
            self.pipe(phase, &["tee", CLUSTERCTL_CONFIG_PATH], &overrides).await?;
            init.push_str(&format!(" --config {CLUSTERCTL_CONFIG_PATH}"));
        }
        if let Some(kc) = kubeconfig {
            init.push_str(&format!(" --kubeconfig {kc}"));
        }
        self.exec_env(phase, &init, &view.capx_env_vars).await?;
        Ok(())
    }

    async fn create_tolerating_exists(&self, phase: &'static str, cmd: &str) -> Result<()> {
        match self.node.exec(cmd, ExecOpts::default()).await {
            Ok(_) => Ok(()),
            Err(ExecError::ExecFailed { stderr, .. })
                if stderr.contains("AlreadyExists") || stderr.contains("already exists") =>
            {
                Ok(())
            }
            Err(e) => Err(PipelineError::exec(phase, e)),
        }
    }

    async fn generate_manifests(&self, ctx: &RunCtx, state: &mut PipelineState) -> Result<()> {
        let view = ctx.provider.view();
        let azs = availability_zones(&ctx.cluster);
        let render_ctx = context! {
            cluster => &ctx.cluster,
            azs => azs,
            project_id => gcp_project(ctx),
            subscription_id => azure_subscription(ctx),
        };
        let manifest = self
            .renderer
            .render(view.capx_provider, "cluster.tmpl", render_ctx)
            .map_err(|e| PipelineError::render(P_MANIFESTS, e))?;
        let manifest_path = format!("{MANIFESTS_DIR}/cluster_{}.yaml", ctx.name());
        self.exec(P_MANIFESTS, &format!("mkdir -p {MANIFESTS_DIR}")).await?;
        self.pipe(P_MANIFESTS, &["tee", &manifest_path], &manifest).await?;
        state.manifest_path = Some(manifest_path);

        self.create_tolerating_exists(
            P_MANIFESTS,
            &format!("kubectl create ns {}", ctx.capi_namespace()),
        )
        .await?;

        let netpol = self
            .renderer
            .raw("common", "allow-all-egress_netpol.yaml")
            .map_err(|e| PipelineError::render(P_MANIFESTS, e))?;
        self.pipe(P_MANIFESTS, &["tee", EGRESS_NETPOL_PATH], &netpol).await?;

        // Cluster-operator values; the operator image comes from the
        // keos registry.
        let (registry_host, repository) = split_registry(&ctx.private.keos_reg_url);
        let values = self
            .renderer
            .render(
                "common",
                "cluster-operator-values.tmpl",
                context! {
                    pull_secrets_enabled => true,
                    pull_secret_name => "regcred-keoscluster",
                    registry => registry_host,
                    repository => format!("{repository}/stratio/cluster-operator"),
                    tag => state.operator_version.clone().unwrap_or_default(),
                },
            )
            .map_err(|e| PipelineError::render(P_MANIFESTS, e))?;
        self.pipe(P_MANIFESTS, &["tee", OPERATOR_VALUES_PATH], &values).await?;
        state.operator_values_path = Some(OPERATOR_VALUES_PATH.to_string());

        // KeosCluster manifest with the merged credentials filled in.
        let filled = fill_credentials(&ctx.cluster, &ctx.bundle);
        let keoscluster = filled.to_yaml()?;
        self.pipe(P_MANIFESTS, &["tee", "/kind/keoscluster.yaml"], &keoscluster).await?;

        if ctx.cluster.spec.cluster_config.is_some() {
            let config = self
                .renderer
                .render(
                    "common",
                    "clusterconfig.tmpl",
                    context! {
                        cluster_name => ctx.name(),
                        namespace => ctx.capi_namespace(),
                        eks_lb_controller => ctx.cluster.spec.cluster_config.as_ref().map(|c| c.eks_lb_controller).unwrap_or(false),
                        private => ctx.private.private,
                    },
                )
                .map_err(|e| PipelineError::render(P_MANIFESTS, e))?;
            self.pipe(P_MANIFESTS, &["tee", "/kind/clusterconfig.yaml"], &config).await?;
        }
        Ok(())
    }

    async fn create_cluster(&self, ctx: &RunCtx, state: &PipelineState) -> Result<()> {
        // Registry secret spanning every configured registry.
        let mut secret_cmd =
            "kubectl create secret docker-registry regcred-keoscluster --namespace=kube-system"
                .to_string();
        for creds in &ctx.bundle.docker_registries {
            secret_cmd.push_str(&format!(
                " --docker-server={} --docker-username={} --docker-password={}",
                creds.url, creds.user, creds.pass
            ));
        }
        if ctx.bundle.docker_registries.is_empty() {
            secret_cmd.push_str(&format!(
                " --docker-server={} --docker-username={} --docker-password={}",
                ctx.bundle.keos_registry.url,
                ctx.bundle.keos_registry.user,
                ctx.bundle.keos_registry.pass
            ));
        }
        self.create_tolerating_exists(P_CREATE, &secret_cmd).await?;

        let values = state
            .operator_values_path
            .as_deref()
            .unwrap_or(OPERATOR_VALUES_PATH);
        self.exec(
            P_CREATE,
            &format!("helm install cluster-operator /stratio/helm/cluster-operator --values {values}"),
        )
        .await?;
        self.wait_for(
            P_CREATE,
            "deployment/keoscluster-controller-manager",
            "kubectl rollout status deployment/keoscluster-controller-manager --namespace=kube-system --timeout=300s",
        )
        .await?;

        if ctx.cluster.spec.cluster_config.is_some() {
            self.exec(P_CREATE, "kubectl apply -f /kind/clusterconfig.yaml").await?;
        }
        self.exec(P_CREATE, "kubectl apply -f /kind/keoscluster.yaml").await?;

        // The operator renders the Cluster object; poll until it shows up.
        let ns = ctx.capi_namespace();
        let name = ctx.name();
        self.node
            .exec(
                &format!("kubectl -n {ns} get cluster {name}"),
                ExecOpts::appear(),
            )
            .await
            .map_err(|_| PipelineError::Timeout {
                phase: P_CREATE,
                resource: format!("cluster/{name}"),
            })?;

        self.wait_for(
            P_CREATE,
            &format!("cluster/{name} ControlPlaneInitialized"),
            &format!(
                "kubectl -n {ns} wait --for=condition=ControlPlaneInitialized --timeout=25m cluster {name}"
            ),
        )
        .await
    }

    async fn save_kubeconfig(&self, ctx: &RunCtx, state: &mut PipelineState) -> Result<()> {
        let ns = ctx.capi_namespace();
        let name = ctx.name();
        let kubeconfig = self
            .exec(
                P_KUBECONFIG,
                &format!("clusterctl -n {ns} get kubeconfig {name} | tee {KUBECONFIG_PATH}"),
            )
            .await?;
        if kubeconfig.trim().is_empty() {
            return Err(PipelineError::Config(
                "clusterctl returned an empty workload kubeconfig".to_string(),
            ));
        }

        let local = self.options.local_output.join(WORK_KUBECONFIG_PATH);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::io(&parent.display().to_string(), e))?;
        }
        std::fs::write(&local, &kubeconfig)
            .map_err(|e| PipelineError::io(&local.display().to_string(), e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| PipelineError::io(&local.display().to_string(), e))?;
        }

        self.create_tolerating_exists(
            P_KUBECONFIG,
            &format!(
                "kubectl -n {ns} create secret generic worker-kubeconfig --from-file=value={KUBECONFIG_PATH}"
            ),
        )
        .await?;
        state.kubeconfig = Some(KUBECONFIG_PATH.to_string());
        Ok(())
    }

    async fn prepare_workload(&self, ctx: &RunCtx) -> Result<()> {
        let view = ctx.provider.view();

        if !view.managed {
            ctx.provider
                .install_cloud_provider(self.node.as_ref(), KUBECONFIG_PATH, &ctx.private, &ctx.cluster)
                .await
                .map_err(|e| PipelineError::provider(P_PREPARE, e))?;
        }

        // Calico: CNI on unmanaged clusters, network-policy engine on
        // managed ones.
        if ctx.private.private {
            // Digest-pinned images cannot come from the mirrored
            // registry, drop the digests before installing.
            self.exec(
                P_PREPARE,
                "sed -i 's/@sha256:[0-9a-f]*//g' /stratio/helm/tigera-operator/values.yaml",
            )
            .await?;
        }
        let mut calico = nimbus_charts::InstallSpec::new("tigera-operator", "tigera-operator", "tigera-operator")
            .create_namespace()
            .kubeconfig(KUBECONFIG_PATH);
        if ctx.private.private {
            calico = calico.set("installation.registry", &ctx.private.keos_reg_url);
        }
        self.exec(P_PREPARE, &calico.command()).await?;

        let netpol = self
            .renderer
            .raw("common", "allow-all-egress_netpol.yaml")
            .map_err(|e| PipelineError::render(P_PREPARE, e))?;
        for ns in ["tigera-operator", "calico-system"] {
            let mut argv = vec!["kubectl", "--kubeconfig", KUBECONFIG_PATH, "-n", ns];
            argv.extend(["apply", "-f", "-"]);
            // calico-system appears once the operator reconciles; a
            // failed apply there is retried by the runner.
            let _ = self.node.pipe(&argv, &netpol).await;
        }

        // Pin the coredns spread over the fresh nodes.
        self.exec(
            P_PREPARE,
            &format!(
                "kubectl --kubeconfig {KUBECONFIG_PATH} -n kube-system rollout restart deployment coredns"
            ),
        )
        .await?;

        if view.capx_provider == "gcp" {
            let internal = ctx
                .provider
                .internal_nginx(&ctx.cluster.spec.networks)
                .await
                .map_err(|e| PipelineError::provider(P_PREPARE, e))?;
            if internal {
                let rbac = self
                    .renderer
                    .raw("gcp", "rbac-loadbalancing.yaml")
                    .map_err(|e| PipelineError::render(P_PREPARE, e))?;
                self.apply_file(P_PREPARE, Some(KUBECONFIG_PATH), &rbac).await?;
            }
        }

        if view.capx_provider == "aws" && view.managed {
            self.exec(
                P_PREPARE,
                "kubectl -n capa-system rollout restart deployment capa-controller-manager",
            )
            .await?;
            let rbac = self
                .renderer
                .raw("aws", "aws-node-rbac.yaml")
                .map_err(|e| PipelineError::render(P_PREPARE, e))?;
            self.apply_file(P_PREPARE, Some(KUBECONFIG_PATH), &rbac).await?;
        }

        if !view.managed {
            ctx.provider
                .install_csi(self.node.as_ref(), KUBECONFIG_PATH, &ctx.private)
                .await
                .map_err(|e| PipelineError::provider(P_PREPARE, e))?;
        }
        Ok(())
    }

    async fn wait_nodes(&self, ctx: &RunCtx) -> Result<()> {
        let ns = ctx.capi_namespace();
        let view = ctx.provider.view();

        let selector = if view.managed { "mp" } else { "md" };
        self.wait_for(
            P_NODES,
            &format!("--all {selector}"),
            &format!("kubectl -n {ns} wait --for=condition=Ready --timeout=15m --all {selector}"),
        )
        .await?;

        if !view.managed && ctx.cluster.spec.control_plane.highly_available {
            self.wait_for(
                P_NODES,
                "kubeadmcontrolplane readyReplicas=3",
                &format!(
                    "kubectl -n {ns} wait --for=jsonpath='{{.status.readyReplicas}}'=3 --timeout=10m kubeadmcontrolplane {}-control-plane",
                    ctx.name()
                ),
            )
            .await?;
        }

        ctx.provider
            .apply_nodes_identity(&ctx.cluster)
            .await
            .map_err(|e| PipelineError::provider(P_NODES, e))?;
        Ok(())
    }

    async fn run_crossplane(
        &self,
        ctx: &RunCtx,
        kubeconfig: Option<&str>,
        state: &mut PipelineState,
    ) -> Result<()> {
        let addons = ctx.provider.addons(ctx.cluster.spec.dns.hosted_zones);
        if addons.is_empty() {
            return Ok(());
        }

        let mut custom = BTreeMap::new();
        match &ctx.bundle.provider {
            nimbus_vault::CloudCreds::Gcp(gcp) => {
                custom.insert("projectId".to_string(), gcp.project_id.clone());
            }
            nimbus_vault::CloudCreds::Azure(azure) => {
                custom.insert("subscriptionId".to_string(), azure.subscription_id.clone());
                custom.insert("tenantId".to_string(), azure.tenant_id.clone());
            }
            nimbus_vault::CloudCreds::Aws(_) => {}
        }
        let view = ctx.provider.view();
        if view.capx_provider == "aws" && view.managed {
            let id = match &state.oidc_provider_id {
                Some(id) => id.clone(),
                None => {
                    let host = self
                        .exec(
                            P_CROSSPLANE,
                            &format!(
                                "kubectl -n {} get cluster {} -o jsonpath='{{.spec.controlPlaneEndpoint.host}}'",
                                ctx.capi_namespace(),
                                ctx.name()
                            ),
                        )
                        .await?;
                    let id = oidc_provider_id(host.trim())
                        .map_err(|e| PipelineError::provider(P_CROSSPLANE, e))?;
                    state.oidc_provider_id = Some(id.clone());
                    id
                }
            };
            custom.insert("oidcProviderId".to_string(), id);
        }

        let phase = if kubeconfig.is_some() {
            P_CROSSPLANE_WORKLOAD
        } else {
            P_CROSSPLANE
        };
        let run = CrossplaneRun {
            node: self.node.as_ref(),
            renderer: &self.renderer,
            provider: ctx.provider.as_ref(),
            cluster: &ctx.cluster,
            private: &ctx.private,
            kubeconfig,
            addons,
            custom_params: custom,
            settle: self.options.crossplane_settle,
        };
        run.run()
            .await
            .map_err(|source| PipelineError::Crossplane { phase, source })
    }

    async fn harden_capx_namespaces(&self, ctx: &RunCtx) -> Result<()> {
        let view = ctx.provider.view();
        self.exec(
            P_CAPX_WORKLOAD,
            &format!(
                "kubectl --kubeconfig {KUBECONFIG_PATH} -n capi-system scale --replicas 2 deploy capi-controller-manager"
            ),
        )
        .await?;

        let mut namespaces = vec!["capi-system".to_string(), view.capx_namespace(), "cert-manager".to_string()];
        if !view.managed {
            namespaces.push("capi-kubeadm-bootstrap-system".to_string());
            namespaces.push("capi-kubeadm-control-plane-system".to_string());
        }
        for ns in namespaces {
            self.exec(
                P_CAPX_WORKLOAD,
                &format!(
                    "kubectl --kubeconfig {KUBECONFIG_PATH} -n {ns} apply -f {EGRESS_NETPOL_PATH}"
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn install_flux(&self, ctx: &RunCtx) -> Result<()> {
        let private = ctx.private.private.then_some(ctx.private.keos_reg_url.as_str());
        nimbus_charts::flux::install_flux(self.node.as_ref(), KUBECONFIG_PATH, private)
            .await
            .map_err(|e| PipelineError::chart(P_FLUX, e))?;
        nimbus_charts::flux::reconcile_charts(
            self.node.as_ref(),
            &self.renderer,
            KUBECONFIG_PATH,
            &ctx.registry,
            &ctx.inventory,
        )
        .await
        .map_err(|e| PipelineError::chart(P_FLUX, e))
    }

    async fn enable_self_healing(&self, ctx: &RunCtx) -> Result<()> {
        let mhc = self
            .renderer
            .render(
                "common",
                "machinehealthcheck.tmpl",
                context! {
                    cluster_name => ctx.name(),
                    namespace => ctx.capi_namespace(),
                    node_startup_timeout => if ctx.provider.view().managed { "20m" } else { "15m" },
                    max_unhealthy => "40%",
                },
            )
            .map_err(|e| PipelineError::render(P_SELF_HEALING, e))?;
        self.apply_file(P_SELF_HEALING, None, &mhc).await
    }

    async fn apply_global_netpols(&self, ctx: &RunCtx) -> Result<()> {
        let view = ctx.provider.view();
        if view.capx_provider != "aws" || !view.managed {
            return Ok(());
        }
        self.exec(
            P_NETPOL,
            &format!(
                "kubectl --kubeconfig {KUBECONFIG_PATH} -n kube-system apply -f {EGRESS_NETPOL_PATH}"
            ),
        )
        .await?;
        for name in [
            "deny-all-egress-imds_gnetpol.yaml",
            "allow-capx-egress-imds_gnetpol.yaml",
        ] {
            let policy = self
                .renderer
                .raw("aws", name)
                .map_err(|e| PipelineError::render(P_NETPOL, e))?;
            self.apply_file(P_NETPOL, Some(KUBECONFIG_PATH), &policy).await?;
        }
        Ok(())
    }

    async fn install_autoscaler(&self, ctx: &RunCtx) -> Result<()> {
        // The aws-load-balancer-controller rides along in this phase
        // when the cluster config asked for it.
        if ctx.inventory.get("aws-load-balancer-controller").is_some() {
            ctx.provider
                .install_lb_controller(self.node.as_ref(), KUBECONFIG_PATH, &ctx.private)
                .await
                .map_err(|e| PipelineError::provider(P_AUTOSCALER, e))?;
        }

        if ctx.inventory.get("cluster-autoscaler").is_none() {
            info!("cluster-autoscaler not in inventory for this variant, skipping");
            return Ok(());
        }
        let spec = nimbus_charts::InstallSpec::new("cluster-autoscaler", "cluster-autoscaler", "kube-system")
            .kubeconfig(KUBECONFIG_PATH)
            .set("autoDiscovery.clusterName", ctx.name())
            .set(
                "autoDiscovery.labels[0].namespace",
                &ctx.capi_namespace(),
            )
            .set("cloudProvider", "clusterapi")
            .set("clusterAPIMode", "incluster-incluster");
        self.exec(P_AUTOSCALER, &spec.command()).await?;
        Ok(())
    }

    async fn install_workload_operator(&self, ctx: &RunCtx) -> Result<()> {
        if ctx.provider.view().managed {
            // The workload cluster needs the registry secret before the
            // operator image can be pulled.
            self.exec(
                P_OPERATOR,
                &format!(
                    "kubectl get secret --namespace=kube-system regcred-keoscluster -o yaml | kubectl apply --kubeconfig {KUBECONFIG_PATH} -f-"
                ),
            )
            .await?;
        }
        self.exec(
            P_OPERATOR,
            &format!(
                "helm install cluster-operator /stratio/helm/cluster-operator --kubeconfig {KUBECONFIG_PATH} --values {OPERATOR_VALUES_PATH}"
            ),
        )
        .await?;
        self.wait_for(
            P_OPERATOR,
            "deployment/keoscluster-controller-manager",
            &format!(
                "kubectl rollout status deployment/keoscluster-controller-manager --kubeconfig {KUBECONFIG_PATH} -n kube-system --timeout=300s"
            ),
        )
        .await
    }

    async fn backup(&self, ctx: &RunCtx) -> Result<()> {
        let local_backup = self.options.local_output.join(LOCAL_BACKUP_DIR);
        std::fs::create_dir_all(&local_backup)
            .map_err(|e| PipelineError::io(&local_backup.display().to_string(), e))?;

        self.exec(
            P_BACKUP,
            &format!("mkdir -p {BACKUP_OBJECTS_DIR} && chmod -R 0755 {BACKUP_OBJECTS_DIR}"),
        )
        .await?;
        self.exec(
            P_BACKUP,
            &format!(
                "clusterctl move -n {} --to-directory {BACKUP_OBJECTS_DIR}",
                ctx.capi_namespace()
            ),
        )
        .await?;

        for path in [BACKUP_OBJECTS_DIR, MANIFESTS_DIR] {
            self.node
                .copy_from(path, &local_backup)
                .await
                .map_err(|e| PipelineError::exec(P_BACKUP, e))?;
        }
        Ok(())
    }

    async fn move_management(&self, ctx: &RunCtx) -> Result<()> {
        let ns = ctx.capi_namespace();
        let name = ctx.name();

        self.exec(P_MOVE, "helm uninstall cluster-operator").await?;

        self.create_tolerating_exists(
            P_MOVE,
            &format!("kubectl --kubeconfig {KUBECONFIG_PATH} create ns {ns}"),
        )
        .await?;

        self.node
            .exec(
                &format!("clusterctl move -n {ns} --to-kubeconfig {KUBECONFIG_PATH}"),
                ExecOpts::default(),
            )
            .await
            .map_err(|e| PipelineError::PivotFailed(e.to_string()))?;

        // Migrate the operator CRs: re-apply against the workload
        // cluster (apply drops status), clear finalizers, delete from
        // the bootstrap side.
        let mut kinds = Vec::new();
        if ctx.cluster.spec.cluster_config.is_some() {
            kinds.push(("clusterconfig", format!("{name}-config")));
        }
        kinds.push(("keoscluster", name.to_string()));
        for (kind, object) in kinds {
            self.exec(
                P_MOVE,
                &format!(
                    "kubectl get {kind} -n {ns} {object} -o yaml | kubectl apply --kubeconfig {KUBECONFIG_PATH} -f-"
                ),
            )
            .await?;
            self.exec(
                P_MOVE,
                &format!(
                    "kubectl patch {kind} -n {ns} {object} -p '{{\"metadata\":{{\"finalizers\":null}}}}' --type=merge"
                ),
            )
            .await?;
            self.exec(P_MOVE, &format!("kubectl delete {kind} -n {ns} {object}")).await?;
        }
        Ok(())
    }

    async fn emit_keos_descriptor(&self, ctx: &RunCtx) -> Result<()> {
        let spec = &ctx.cluster.spec;
        let descriptor = self
            .renderer
            .render(
                "common",
                "keos-descriptor.tmpl",
                context! {
                    cluster_name => ctx.name(),
                    provider => spec.infra_provider.as_str(),
                    region => &spec.region,
                    k8s_version => &spec.k8s_version,
                    external_domain => spec.external_domain.clone().unwrap_or_default(),
                    domain => spec.keos.domain.clone().unwrap_or_default(),
                    flavour => spec.keos.flavour.clone().unwrap_or_default(),
                    version => spec.keos.version.clone().unwrap_or_default(),
                    storage_class_name => "keos",
                    keos_registry => &ctx.private.keos_reg_url,
                    external_registry => "",
                },
            )
            .map_err(|e| PipelineError::render(P_KEOS, e))?;
        let path = self.options.local_output.join("keos.yaml");
        std::fs::write(&path, descriptor)
            .map_err(|e| PipelineError::io(&path.display().to_string(), e))?;

        let vars = ctx
            .provider
            .override_vars(&spec.networks, spec.cluster_config.as_ref())
            .await
            .map_err(|e| PipelineError::provider(P_KEOS, e))?;
        if !vars.is_empty() {
            let dir = self.options.local_output.join("override-vars");
            std::fs::create_dir_all(&dir)
                .map_err(|e| PipelineError::io(&dir.display().to_string(), e))?;
            for (file, bytes) in vars {
                let path = dir.join(file);
                std::fs::write(&path, bytes)
                    .map_err(|e| PipelineError::io(&path.display().to_string(), e))?;
            }
        }
        info!("KEOS descriptor written");
        Ok(())
    }
}

/// Target availability zones: the subnets' zones when pinned, the
/// provider's conventional three otherwise.
fn availability_zones(cluster: &KeosCluster) -> Vec<String> {
    let from_subnets: Vec<String> = cluster
        .spec
        .networks
        .subnets
        .iter()
        .filter_map(|s| s.availability_zone.clone())
        .take(3)
        .collect();
    if from_subnets.len() == 3 {
        return from_subnets;
    }
    let region = &cluster.spec.region;
    match cluster.spec.infra_provider {
        InfraProvider::Aws => vec![
            format!("{region}a"),
            format!("{region}b"),
            format!("{region}c"),
        ],
        InfraProvider::Gcp => vec![
            format!("{region}-a"),
            format!("{region}-b"),
            format!("{region}-c"),
        ],
        InfraProvider::Azure => vec!["1".into(), "2".into(), "3".into()],
    }
}

fn fill_credentials(cluster: &KeosCluster, bundle: &CredentialsBundle) -> KeosCluster {
    let mut filled = cluster.clone();
    filled.spec.credentials = Some(InlineCredentials {
        aws: None,
        gcp: None,
        azure: None,
        github_token: bundle.github_token.clone(),
        docker_registries: bundle.docker_registries.clone(),
    });
    filled
}

fn split_registry(url: &str) -> (String, String) {
    match url.split_once('/') {
        Some((host, path)) => (host.to_string(), path.to_string()),
        None => (url.to_string(), String::new()),
    }
}

fn gcp_project(ctx: &RunCtx) -> String {
    match &ctx.bundle.provider {
        nimbus_vault::CloudCreds::Gcp(gcp) => gcp.project_id.clone(),
        _ => String::new(),
    }
}

fn azure_subscription(ctx: &RunCtx) -> String {
    match &ctx.bundle.provider {
        nimbus_vault::CloudCreds::Azure(azure) => azure.subscription_id.clone(),
        _ => String::new(),
    }
}
