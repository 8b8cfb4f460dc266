//! Deterministic synthesis of node specs from weighted templates. The same
//! seed and config always produce the same fleet, byte for byte.

use fleetsim_configs::{FleetGenConfig, NodeSpec};
use rand::{Rng, SeedableRng as _};
use rand_chacha::ChaCha20Rng;
use thiserror::Error;
use tracing::info;

const DEFAULT_PROVIDERS: [(&str, u32); 3] = [("aws", 35), ("gcp", 50), ("lambda", 15)];

const DEFAULT_REGIONS: [(&str, u32); 5] = [
    ("asia-east1", 10),
    ("europe-west1", 15),
    ("us-central1", 30),
    ("us-east1", 25),
    ("us-west1", 20),
];

const ZONE_SUFFIXES: [&str; 4] = ["a", "b", "c", "d"];

#[derive(Debug, Error)]
pub enum FleetGenError {
    #[error("fleet generator requires at least one template for {total_nodes} nodes")]
    NoTemplates { total_nodes: usize },
}

/// Seeded generator over a fleet-gen config.
pub struct FleetGenerator {
    config: FleetGenConfig,
    rng: ChaCha20Rng,
}

impl FleetGenerator {
    #[must_use]
    pub fn new(config: FleetGenConfig, seed: u64) -> Self {
        Self {
            config,
            rng: ChaCha20Rng::seed_from_u64(seed),
        }
    }

    /// Produces the full spec sequence. `total_nodes == 0` is an empty fleet,
    /// not an error.
    pub fn generate(&mut self) -> Result<Vec<NodeSpec>, FleetGenError> {
        let total = self.config.total_nodes;
        if total == 0 {
            return Ok(Vec::new());
        }
        if self.config.templates.is_empty() {
            return Err(FleetGenError::NoTemplates { total_nodes: total });
        }

        // Weighted tables are key-sorted before any roll; BTreeMap iteration
        // already yields ascending keys.
        let providers: Vec<(String, u32)> = if self.config.providers.is_empty() {
            DEFAULT_PROVIDERS
                .iter()
                .map(|(name, weight)| ((*name).to_owned(), *weight))
                .collect()
        } else {
            self.config
                .providers
                .iter()
                .map(|(name, weight)| (name.clone(), *weight))
                .collect()
        };
        let regions: Vec<(String, u32)> = if self.config.regions.is_empty() {
            DEFAULT_REGIONS
                .iter()
                .map(|(name, weight)| ((*name).to_owned(), *weight))
                .collect()
        } else {
            self.config
                .regions
                .iter()
                .map(|(name, weight)| (name.clone(), *weight))
                .collect()
        };
        let template_weights: Vec<u32> = self
            .config
            .templates
            .iter()
            .map(|template| template.weight)
            .collect();
        let provider_weights: Vec<u32> = providers.iter().map(|(_, weight)| *weight).collect();
        let region_weights: Vec<u32> = regions.iter().map(|(_, weight)| *weight).collect();

        let mut specs = Vec::with_capacity(total);
        for index in 0..total {
            let template =
                self.config.templates[weighted_index(&mut self.rng, &template_weights)].clone();
            let provider = providers[weighted_index(&mut self.rng, &provider_weights)]
                .0
                .clone();
            let region = regions[weighted_index(&mut self.rng, &region_weights)].0.clone();
            let zone = self.pick_zone(&region);
            let instance_type = instance_type(&provider, &template.gpu_type, template.gpu_count);
            let id = format!("{provider}-{region}-{}-{index:04}", template.name);

            specs.push(NodeSpec {
                id,
                provider,
                region,
                zone,
                instance_type,
                gpu_count: template.gpu_count,
                gpu_type: template.gpu_type.clone(),
                labels: template.labels.clone(),
            });
        }

        info!(nodes = specs.len(), "fleet generated");
        Ok(specs)
    }

    fn pick_zone(&mut self, region: &str) -> String {
        match self.config.zones.get(region) {
            Some(zones) if !zones.is_empty() => {
                zones[self.rng.gen_range(0..zones.len())].clone()
            }
            _ => {
                let suffix = ZONE_SUFFIXES[self.rng.gen_range(0..ZONE_SUFFIXES.len())];
                format!("{region}-{suffix}")
            }
        }
    }
}

/// Rolls uniformly in `[0, total)` and walks the weights; a zero total maps
/// to index 0.
fn weighted_index(rng: &mut ChaCha20Rng, weights: &[u32]) -> usize {
    let total: u64 = weights.iter().copied().map(u64::from).sum();
    if total == 0 {
        return 0;
    }
    let mut roll = rng.gen_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        let weight = u64::from(*weight);
        if roll < weight {
            return index;
        }
        roll -= weight;
    }
    weights.len() - 1
}

/// (provider, GPU type, GPU count) to machine shape.
fn instance_type(provider: &str, gpu_type: &str, gpu_count: u32) -> String {
    let family = gpu_type.to_ascii_uppercase();
    match provider {
        "gcp" => match family.as_str() {
            kind if kind.contains("H100") => format!("a3-highgpu-{gpu_count}g"),
            kind if kind.contains("A100") => format!("a2-highgpu-{gpu_count}g"),
            kind if kind.contains("A10G") || kind.contains("L4") => match gpu_count {
                0..=1 => "g2-standard-12".to_owned(),
                2..=4 => "g2-standard-24".to_owned(),
                _ => "g2-standard-96".to_owned(),
            },
            kind if kind.contains("T4") => format!("n1-standard-{}", 8 * gpu_count.max(1)),
            kind if kind.contains("V100") => format!("n1-highmem-{}", 8 * gpu_count.max(1)),
            _ => format!("gcp-gpu-{gpu_count}x"),
        },
        "aws" => match family.as_str() {
            kind if kind.contains("H100") => "p5.48xlarge".to_owned(),
            kind if kind.contains("A100") => "p4d.24xlarge".to_owned(),
            kind if kind.contains("A10G") => match gpu_count {
                0..=1 => "g5.xlarge".to_owned(),
                2..=4 => "g5.12xlarge".to_owned(),
                _ => "g5.48xlarge".to_owned(),
            },
            kind if kind.contains("L4") => match gpu_count {
                0..=1 => "g6.xlarge".to_owned(),
                2..=4 => "g6.12xlarge".to_owned(),
                _ => "g6.48xlarge".to_owned(),
            },
            kind if kind.contains("T4") => match gpu_count {
                0..=1 => "g4dn.xlarge".to_owned(),
                2..=4 => "g4dn.12xlarge".to_owned(),
                _ => "g4dn.metal".to_owned(),
            },
            kind if kind.contains("V100") => match gpu_count {
                0..=1 => "p3.2xlarge".to_owned(),
                2..=4 => "p3.8xlarge".to_owned(),
                _ => "p3.16xlarge".to_owned(),
            },
            _ => format!("aws-gpu-{gpu_count}x"),
        },
        "lambda" => format!("gpu_{gpu_count}x_{}", family.to_ascii_lowercase()),
        _ => format!("{provider}-gpu-{gpu_count}x-{}", family.to_ascii_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use fleetsim_configs::NodeTemplate;

    use super::*;

    fn config(total: usize) -> FleetGenConfig {
        FleetGenConfig {
            total_nodes: total,
            templates: vec![
                NodeTemplate {
                    name: "h100".to_owned(),
                    weight: 70,
                    gpu_count: 8,
                    gpu_type: "H100".to_owned(),
                    labels: Default::default(),
                },
                NodeTemplate {
                    name: "a100".to_owned(),
                    weight: 30,
                    gpu_count: 8,
                    gpu_type: "A100".to_owned(),
                    labels: Default::default(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn same_seed_yields_identical_fleet() {
        let first = FleetGenerator::new(config(50), 42).generate().expect("generates");
        let second = FleetGenerator::new(config(50), 42).generate().expect("generates");
        assert_eq!(first, second);
    }

    #[test]
    fn different_seeds_diverge() {
        let first = FleetGenerator::new(config(50), 42).generate().expect("generates");
        let second = FleetGenerator::new(config(50), 43).generate().expect("generates");
        assert_ne!(first, second);
    }

    #[test]
    fn zero_nodes_is_empty_not_an_error() {
        let specs = FleetGenerator::new(config(0), 1).generate().expect("generates");
        assert!(specs.is_empty());

        let no_templates = FleetGenConfig {
            total_nodes: 0,
            ..Default::default()
        };
        assert!(FleetGenerator::new(no_templates, 1)
            .generate()
            .expect("empty fleet needs no templates")
            .is_empty());
    }

    #[test]
    fn templates_are_required_for_nonempty_fleets() {
        let cfg = FleetGenConfig {
            total_nodes: 3,
            ..Default::default()
        };
        assert!(matches!(
            FleetGenerator::new(cfg, 1).generate(),
            Err(FleetGenError::NoTemplates { .. })
        ));
    }

    #[test]
    fn template_mix_tracks_weights() {
        let specs = FleetGenerator::new(config(2000), 7).generate().expect("generates");
        let h100 = specs.iter().filter(|spec| spec.gpu_type == "H100").count();
        let share = h100 as f64 / specs.len() as f64;
        assert!((0.6..0.8).contains(&share), "h100 share {share}");
    }

    #[test]
    fn ids_compose_provider_region_template_index() {
        let specs = FleetGenerator::new(config(3), 9).generate().expect("generates");
        for (index, spec) in specs.iter().enumerate() {
            let expected_suffix = format!("-{index:04}");
            assert!(spec.id.ends_with(&expected_suffix), "id {}", spec.id);
            assert!(spec.id.starts_with(&format!("{}-{}-", spec.provider, spec.region)));
            assert!(spec.zone.starts_with(&spec.region));
        }
    }

    #[test]
    fn weighted_index_handles_degenerate_weights() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        assert_eq!(weighted_index(&mut rng, &[0, 0, 0]), 0);
        assert_eq!(weighted_index(&mut rng, &[5]), 0);
        for _ in 0..100 {
            let index = weighted_index(&mut rng, &[1, 0, 1]);
            assert_ne!(index, 1);
        }
    }
}
