//! Embedded prompts
//!
//! Compiled into the binary from .pmt files at build time.

/// Operation classification prompt
pub const CLASSIFY: &str = include_str!("../../prompts/classify.pmt");

/// Semantic decomposition prompt
pub const PLAN: &str = include_str!("../../prompts/plan.pmt");

/// Coordinated SCC-group planning prompt
pub const SCC_PLAN: &str = include_str!("../../prompts/scc_plan.pmt");

/// Resolver layer-match prompt
pub const LAYER_MATCH: &str = include_str!("../../prompts/layer_match.pmt");

/// Optimization dimension discovery prompt
pub const DIMENSIONS: &str = include_str!("../../prompts/dimensions.pmt");

/// Output scoring prompt
pub const SCORE: &str = include_str!("../../prompts/score.pmt");

/// Get an embedded prompt by name
pub fn get_embedded(name: &str) -> Option<&'static str> {
    match name {
        "classify" => Some(CLASSIFY),
        "plan" => Some(PLAN),
        "scc_plan" => Some(SCC_PLAN),
        "layer_match" => Some(LAYER_MATCH),
        "dimensions" => Some(DIMENSIONS),
        "score" => Some(SCORE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_templates_present() {
        for name in ["classify", "plan", "scc_plan", "layer_match", "dimensions", "score"] {
            assert!(get_embedded(name).is_some(), "missing template {name}");
        }
    }

    #[test]
    fn test_templates_demand_strict_json() {
        for name in ["classify", "plan", "scc_plan", "dimensions", "score"] {
            let template = get_embedded(name).unwrap();
            assert!(template.contains("strict JSON"), "{name} should demand strict JSON");
        }
    }

    #[test]
    fn test_unknown_template() {
        assert!(get_embedded("title").is_none());
    }
}
