//! Embedded template set
//!
//! Keys are `provider/name`; `common` holds provider-neutral documents.

pub const ALL: &[(&str, &str)] = &[
    (
        "common/allow-all-egress_netpol.yaml",
        include_str!("../templates/common/allow-all-egress_netpol.yaml"),
    ),
    (
        "common/crossplane-egress_netpol.yaml",
        include_str!("../templates/common/crossplane-egress_netpol.yaml"),
    ),
    (
        "common/coredns_pdb.yaml",
        include_str!("../templates/common/coredns_pdb.yaml"),
    ),
    (
        "common/coredns-deployment.tmpl",
        include_str!("../templates/common/coredns-deployment.tmpl"),
    ),
    (
        "common/machinehealthcheck.tmpl",
        include_str!("../templates/common/machinehealthcheck.tmpl"),
    ),
    (
        "common/helmrepository.tmpl",
        include_str!("../templates/common/helmrepository.tmpl"),
    ),
    (
        "common/helmrelease.tmpl",
        include_str!("../templates/common/helmrelease.tmpl"),
    ),
    (
        "common/crossplane-provider.tmpl",
        include_str!("../templates/common/crossplane-provider.tmpl"),
    ),
    (
        "common/cluster-operator-values.tmpl",
        include_str!("../templates/common/cluster-operator-values.tmpl"),
    ),
    (
        "common/clusterctl-config.tmpl",
        include_str!("../templates/common/clusterctl-config.tmpl"),
    ),
    (
        "common/clusterconfig.tmpl",
        include_str!("../templates/common/clusterconfig.tmpl"),
    ),
    (
        "common/keos-descriptor.tmpl",
        include_str!("../templates/common/keos-descriptor.tmpl"),
    ),
    ("aws/cluster.tmpl", include_str!("../templates/aws/cluster.tmpl")),
    ("aws/eks.config", include_str!("../templates/aws/eks.config")),
    (
        "aws/ingress-nginx-internal.yaml",
        include_str!("../templates/aws/ingress-nginx-internal.yaml"),
    ),
    (
        "aws/ingress-nginx-public.yaml",
        include_str!("../templates/aws/ingress-nginx-public.yaml"),
    ),
    (
        "aws/deny-all-egress-imds_gnetpol.yaml",
        include_str!("../templates/aws/deny-all-egress-imds_gnetpol.yaml"),
    ),
    (
        "aws/allow-capx-egress-imds_gnetpol.yaml",
        include_str!("../templates/aws/allow-capx-egress-imds_gnetpol.yaml"),
    ),
    (
        "aws/aws-node-rbac.yaml",
        include_str!("../templates/aws/aws-node-rbac.yaml"),
    ),
    (
        "aws/crossplane-provider-config.tmpl",
        include_str!("../templates/aws/crossplane-provider-config.tmpl"),
    ),
    (
        "aws/xrd-hostedzones.yaml",
        include_str!("../templates/aws/xrd-hostedzones.yaml"),
    ),
    (
        "aws/xrd-hostedzones-eks.yaml",
        include_str!("../templates/aws/xrd-hostedzones-eks.yaml"),
    ),
    (
        "aws/composition-hostedzones.tmpl",
        include_str!("../templates/aws/composition-hostedzones.tmpl"),
    ),
    (
        "aws/composition-hostedzones-eks.tmpl",
        include_str!("../templates/aws/composition-hostedzones-eks.tmpl"),
    ),
    (
        "aws/hostedzone.tmpl",
        include_str!("../templates/aws/hostedzone.tmpl"),
    ),
    (
        "aws/hostedzone-eks.tmpl",
        include_str!("../templates/aws/hostedzone-eks.tmpl"),
    ),
    ("gcp/cluster.tmpl", include_str!("../templates/gcp/cluster.tmpl")),
    (
        "gcp/csi-driver.tmpl",
        include_str!("../templates/gcp/csi-driver.tmpl"),
    ),
    (
        "gcp/ingress-nginx-internal.yaml",
        include_str!("../templates/gcp/ingress-nginx-internal.yaml"),
    ),
    (
        "gcp/rbac-loadbalancing.yaml",
        include_str!("../templates/gcp/rbac-loadbalancing.yaml"),
    ),
    (
        "gcp/crossplane-provider-config.tmpl",
        include_str!("../templates/gcp/crossplane-provider-config.tmpl"),
    ),
    (
        "gcp/xrd-hostedzones.yaml",
        include_str!("../templates/gcp/xrd-hostedzones.yaml"),
    ),
    (
        "gcp/composition-hostedzones.tmpl",
        include_str!("../templates/gcp/composition-hostedzones.tmpl"),
    ),
    (
        "gcp/hostedzone.tmpl",
        include_str!("../templates/gcp/hostedzone.tmpl"),
    ),
    (
        "azure/cluster.tmpl",
        include_str!("../templates/azure/cluster.tmpl"),
    ),
    (
        "azure/ingress-nginx-internal.yaml",
        include_str!("../templates/azure/ingress-nginx-internal.yaml"),
    ),
    (
        "azure/crossplane-provider-config.tmpl",
        include_str!("../templates/azure/crossplane-provider-config.tmpl"),
    ),
    (
        "azure/xrd-hostedzones.yaml",
        include_str!("../templates/azure/xrd-hostedzones.yaml"),
    ),
    (
        "azure/composition-hostedzones.tmpl",
        include_str!("../templates/azure/composition-hostedzones.tmpl"),
    ),
    (
        "azure/hostedzone.tmpl",
        include_str!("../templates/azure/hostedzone.tmpl"),
    ),
];
