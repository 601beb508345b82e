//! Unit tests for configuration parsing and validation

#[cfg(test)]
mod cluster_config_validation {
    use std::io::Write;

    use crate::cloud::{Taint, TaintEffect};
    use crate::config::{
        load_config, parse_config, ClusterConfig, ConfigFormat, EndpointAccess, NodePoolSpec,
        ZoneSelection,
    };
    use crate::error::Error;

    /// Helper to create a minimal valid config with one pool
    fn valid_config() -> ClusterConfig {
        let mut config = ClusterConfig::new("demo", "us-west-2");
        config.network_cidr = "10.10.0.0/16".to_string();
        config
            .node_pools
            .insert("general".to_string(), NodePoolSpec::new("m5.large"));
        config
    }

    fn fields(config: &ClusterConfig) -> Vec<String> {
        config
            .validate()
            .unwrap_err()
            .into_iter()
            .map(|e| e.field)
            .collect()
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut config = valid_config();
        config.name = "Demo_Cluster".to_string();
        assert_eq!(fields(&config), vec!["cluster.name"]);

        config.name = "a".repeat(41);
        assert_eq!(fields(&config), vec!["cluster.name"]);
    }

    #[test]
    fn test_cidr_must_be_slash_16() {
        let mut config = valid_config();
        config.network_cidr = "10.10.0.0/20".to_string();
        assert_eq!(fields(&config), vec!["cluster.networkCidr"]);

        config.network_cidr = "10.10.5.0/16".to_string();
        assert_eq!(fields(&config), vec!["cluster.networkCidr"]);

        config.network_cidr = "not-a-cidr".to_string();
        assert_eq!(fields(&config), vec!["cluster.networkCidr"]);

        config.network_cidr = "127.0.0.0/16".to_string();
        assert_eq!(fields(&config), vec!["cluster.networkCidr"]);
    }

    #[test]
    fn test_version_must_be_major_minor() {
        let mut config = valid_config();
        config.kubernetes_version = "latest".to_string();
        assert_eq!(fields(&config), vec!["cluster.kubernetesVersion"]);
    }

    #[test]
    fn test_scaling_bounds_inverted() {
        let mut config = valid_config();
        config.node_pools.insert(
            "batch".to_string(),
            NodePoolSpec {
                min_size: Some(5),
                max_size: Some(2),
                ..NodePoolSpec::new("c5.xlarge")
            },
        );
        assert_eq!(fields(&config), vec!["cluster.nodePools.batch.minSize"]);
    }

    #[test]
    fn test_min_above_default_max_is_rejected() {
        let mut config = valid_config();
        config.node_pools.insert(
            "batch".to_string(),
            NodePoolSpec {
                min_size: Some(4),
                ..NodePoolSpec::new("c5.xlarge")
            },
        );
        assert_eq!(fields(&config), vec!["cluster.nodePools.batch.minSize"]);
    }

    #[test]
    fn test_duplicate_taint_rejected() {
        let mut config = valid_config();
        let pool = config.node_pools.get_mut("general").unwrap();
        pool.taints = vec![
            Taint::new("dedicated", "a", TaintEffect::NoSchedule),
            Taint::new("dedicated", "b", TaintEffect::NoSchedule),
        ];
        assert_eq!(fields(&config), vec!["cluster.nodePools.general.taints"]);
    }

    #[test]
    fn test_private_endpoint_with_public_cidrs() {
        let mut config = valid_config();
        config.endpoint_access = EndpointAccess::Private;
        config.public_access_cidrs = vec!["203.0.113.0/24".to_string()];
        assert_eq!(fields(&config), vec!["cluster.publicAccessCidrs"]);
    }

    #[test]
    fn test_explicit_zones_need_two() {
        let mut config = valid_config();
        config.availability_zones = ZoneSelection::Explicit(vec!["us-west-2a".to_string()]);
        assert_eq!(fields(&config), vec!["cluster.availabilityZones"]);
    }

    #[test]
    fn test_all_errors_reported_together() {
        let mut config = valid_config();
        config.region = String::new();
        config.network_cidr = "10.0.0.0/8".to_string();
        config.encryption_key_arn = Some("my-key".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);

        let err = config.ensure_valid().unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
        assert!(err.to_string().contains("cluster.region"));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
cluster:
  name: demo
  region: us-west-2
  kubernetesVersion: "1.29"
  networkCidr: 10.10.0.0/16
  availabilityZones: auto
  endpointAccess: public-and-private
  publicAccessCidrs: ["203.0.113.0/24"]
  nodePools:
    general:
      instanceType: m5.large
      minSize: 2
      maxSize: 5
    gpu:
      instanceType: g5.xlarge
      gpu: true
      taints:
        - key: nvidia.com/gpu
          value: "true"
          effect: NoSchedule
engine:
  maxParallelPools: 2
"#;
        let file = parse_config(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(file.cluster.availability_zones, ZoneSelection::Auto);
        assert_eq!(file.cluster.endpoint_access, EndpointAccess::PublicAndPrivate);
        assert_eq!(file.cluster.node_pools.len(), 2);
        let gpu = &file.cluster.node_pools["gpu"];
        assert_eq!(gpu.resolved_ami_type(), "AL2023_x86_64_NVIDIA");
        assert_eq!(gpu.taints[0].effect, TaintEffect::NoSchedule);
        assert_eq!(file.engine.max_parallel_pools, 2);
    }

    #[test]
    fn test_unknown_taint_effect_is_a_config_error() {
        let yaml = r#"
cluster:
  name: demo
  region: us-west-2
  nodePools:
    general:
      instanceType: m5.large
      taints:
        - key: dedicated
          effect: Sometimes
"#;
        let err = parse_config(yaml, ConfigFormat::Yaml).unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r#"
cluster:
  name: demo
  region: us-west-2
  nodeCount: 3
"#;
        assert!(parse_config(yaml, ConfigFormat::Yaml).is_err());
    }

    #[test]
    fn test_parse_toml_with_zone_list() {
        let toml = r#"
[cluster]
name = "demo"
region = "eu-west-1"
availabilityZones = ["eu-west-1a", "eu-west-1b"]

[cluster.nodePools.general]
instanceType = "m5.large"
spot = true
"#;
        let file = parse_config(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(
            file.cluster.availability_zones,
            ZoneSelection::Explicit(vec!["eu-west-1a".to_string(), "eu-west-1b".to_string()])
        );
        assert!(file.cluster.node_pools["general"].spot);
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let yaml = r#"
cluster:
  name: demo
  region: us-west-2
engine:
  maxParallelPools: 0
"#;
        let err = parse_config(yaml, ConfigFormat::Yaml).unwrap_err();
        assert!(err.to_string().contains("maxParallelPools"));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "cluster:\n  name: demo\n  region: us-east-1").unwrap();
        let loaded = load_config(file.path()).unwrap();
        assert_eq!(loaded.cluster.name, "demo");
        assert_eq!(loaded.cluster.kubernetes_version, "1.29");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_effective_public_cidrs_default() {
        let config = valid_config();
        assert_eq!(config.effective_public_access_cidrs(), vec!["0.0.0.0/0"]);
    }
}
