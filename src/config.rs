//! TOML parameter-set loading (spec.md §4.8, new/ambient): deserializes potential and BOF
//! registrations from a file and feeds them through the same `add_potential`/
//! `add_bond_order_factor` validation path a programmatic caller would use.
//!
//! Grounded on the teacher's own TOML-backed force-field loading (`open_force_field` /
//! `load_ffs_general`): read the whole file, `serde`-deserialize it, summarize what was found
//! with a `println!`, and propagate the first bad entry as an error rather than skipping it.

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::forms::{BofFormTag, FormTag, PostProcessTag};
use crate::registry::{BofParamSplit, BofRegistry, GroupId, PotentialRegistry, TargetFilter};
use na_seq::Element;

#[derive(Debug, Deserialize)]
struct TargetFilterConfig {
    elements: Option<Vec<String>>,
    tags: Option<Vec<i32>>,
}

impl TargetFilterConfig {
    fn resolve(&self) -> CoreResult<TargetFilter> {
        let mut filter = TargetFilter::any();
        if let Some(names) = &self.elements {
            let mut elements = Vec::with_capacity(names.len());
            for name in names {
                elements.push(parse_element(name)?);
            }
            filter = TargetFilter::elements(elements);
        } else if let Some(tags) = &self.tags {
            filter = TargetFilter::tags(tags.clone());
        }
        Ok(filter)
    }
}

/// Maps a chemical symbol to `na_seq::Element`. Written as an explicit match rather than relying
/// on a string-parsing constructor, since this engine's reference catalog only ever needs a
/// handful of elements across its test scenarios.
fn parse_element(name: &str) -> CoreResult<Element> {
    match name {
        "H" => Ok(Element::Hydrogen),
        "C" => Ok(Element::Carbon),
        "N" => Ok(Element::Nitrogen),
        "O" => Ok(Element::Oxygen),
        "Si" => Ok(Element::Silicon),
        "Na" => Ok(Element::Sodium),
        "Cl" => Ok(Element::Chlorine),
        "Ar" => Ok(Element::Argon),
        other => Err(CoreError::Configuration(format!("unrecognized element symbol: {other}"))),
    }
}

fn parse_form(name: &str) -> CoreResult<FormTag> {
    match name {
        "constant" => Ok(FormTag::Constant),
        "lennard_jones" => Ok(FormTag::LennardJones),
        "bond_bending" => Ok(FormTag::BondBending),
        "dihedral" => Ok(FormTag::Dihedral),
        other => Err(CoreError::Configuration(format!("unknown potential form: {other}"))),
    }
}

fn parse_bof_form(name: &str) -> CoreResult<BofFormTag> {
    match name {
        "neighbors" => Ok(BofFormTag::Neighbors),
        other => Err(CoreError::Configuration(format!("unknown BOF form: {other}"))),
    }
}

fn parse_post_process(name: &str) -> CoreResult<PostProcessTag> {
    match name {
        "c_scale" => Ok(PostProcessTag::CScale),
        other => Err(CoreError::Configuration(format!("unknown BOF post-processor: {other}"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PotentialRecordConfig {
    pub form: String,
    pub params: Vec<f64>,
    pub hard_cutoff: f64,
    pub soft_cutoff: Option<f64>,
    pub targets: Vec<TargetFilterConfig>,
    pub bof_group: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PotentialSetConfig {
    #[serde(default)]
    potential: Vec<PotentialRecordConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BofRecordConfig {
    pub form: String,
    #[serde(default)]
    pub params_one: Vec<f64>,
    #[serde(default)]
    pub params_two: Vec<f64>,
    #[serde(default)]
    pub params_three: Vec<f64>,
    #[serde(default)]
    pub params_four: Vec<f64>,
    pub hard_cutoff: f64,
    pub soft_cutoff: Option<f64>,
    pub targets: Vec<TargetFilterConfig>,
    pub group: u32,
    pub post_process: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BofSetConfig {
    #[serde(default)]
    bof: Vec<BofRecordConfig>,
}

/// Parses and registers every potential in a TOML document, mirroring `add_potential`'s
/// permutation expansion and validation for each entry. Returns the total number of registry
/// records created.
pub fn load_potentials_toml(registry: &mut PotentialRegistry, contents: &str) -> CoreResult<usize> {
    let parsed: PotentialSetConfig = toml::from_str(contents)
        .map_err(|e| CoreError::Configuration(format!("malformed potential TOML: {e}")))?;

    println!("loading {} potential record(s) from TOML", parsed.potential.len());

    let mut created = 0;
    for (n, record) in parsed.potential.into_iter().enumerate() {
        let form = parse_form(&record.form)?;
        let mut targets = Vec::with_capacity(record.targets.len());
        for t in &record.targets {
            targets.push(t.resolve()?);
        }
        let bof_group = record.bof_group.map(GroupId);
        let idxs = registry
            .add_potential(form, record.params, record.hard_cutoff, record.soft_cutoff, targets, bof_group)
            .map_err(|e| CoreError::Configuration(format!("potential entry {n}: {e}")))?;
        created += idxs.len();
    }

    println!("registered {created} potential record(s)");
    Ok(created)
}

/// Parses and registers every BOF in a TOML document, analogously to `load_potentials_toml`.
pub fn load_bofs_toml(registry: &mut BofRegistry, contents: &str) -> CoreResult<usize> {
    let parsed: BofSetConfig = toml::from_str(contents)
        .map_err(|e| CoreError::Configuration(format!("malformed BOF TOML: {e}")))?;

    println!("loading {} BOF record(s) from TOML", parsed.bof.len());

    let mut created = 0;
    for (n, record) in parsed.bof.into_iter().enumerate() {
        let form = parse_bof_form(&record.form)?;
        let mut targets = Vec::with_capacity(record.targets.len());
        for t in &record.targets {
            targets.push(t.resolve()?);
        }
        let params = BofParamSplit {
            one: record.params_one,
            two: record.params_two,
            three: record.params_three,
            four: record.params_four,
        };
        let post_process = record.post_process.as_deref().map(parse_post_process).transpose()?;
        let idxs = registry
            .add_bond_order_factor(
                form, params, record.hard_cutoff, record.soft_cutoff, targets,
                GroupId(record.group), post_process,
            )
            .map_err(|e| CoreError::Configuration(format!("BOF entry {n}: {e}")))?;
        created += idxs.len();
    }

    println!("registered {created} BOF record(s)");
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_single_lennard_jones_entry() {
        let toml = r#"
            [[potential]]
            form = "lennard_jones"
            params = [1.0, 1.0]
            hard_cutoff = 2.5

            [[potential.targets]]
            elements = ["O"]

            [[potential.targets]]
            elements = ["Si"]
        "#;
        let mut registry = PotentialRegistry::new();
        let created = load_potentials_toml(&mut registry, toml).unwrap();
        assert_eq!(created, 2);
    }

    #[test]
    fn unknown_form_is_configuration_error() {
        let toml = r#"
            [[potential]]
            form = "not_a_real_form"
            params = []
            hard_cutoff = 1.0
            targets = []
        "#;
        let mut registry = PotentialRegistry::new();
        let err = load_potentials_toml(&mut registry, toml).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[test]
    fn malformed_toml_is_configuration_error() {
        let mut registry = PotentialRegistry::new();
        let err = load_potentials_toml(&mut registry, "not valid toml {{{").unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }
}
