//! Built-in cortical surface pipeline
//!
//! recon-all per subject, hemisphere selection from its pial surfaces,
//! conversion of each hemisphere to a mesh format, then a combined
//! both-hemisphere mesh. Every step is an external FreeSurfer command.

use crate::config::RunConfig;
use crate::workflow::builder::PipelineBuilder;
use crate::workflow::transform::{Predicate, Transform};
use crate::workflow::types::{NodeTemplate, PipelineTemplate, ResourceRequest, SlotKind, SlotSource};

/// Axis the built-in pipeline iterates over
pub const SUBJECT_AXIS: &str = "subject_id";

/// recon-all, per-hemisphere conversion and the combined mesh, per subject
pub fn surface_pipeline(config: &RunConfig) -> PipelineTemplate {
    let surface = &config.surface;
    let subjects_dir = config.subjects_dir.display().to_string();

    let recon = NodeTemplate::new("recon", "recon-all")
        .args([
            "-s",
            "{subject_id}",
            "-i",
            "{t1}",
            "-{directive}",
            "-sd",
            "{subjects_dir}",
            "-openmp",
            "{openmp}",
        ])
        .source_input(
            "t1",
            SlotKind::File,
            SlotSource::Dataset {
                transform: Transform::select(Predicate::Suffix(surface.t1_suffix.clone())),
            },
        )
        .param("directive", surface.directive.clone())
        .param("subjects_dir", subjects_dir)
        .param("openmp", surface.openmp.to_string())
        .output_list(
            "pial",
            [
                "{subjects_dir}/{subject_id}/surf/lh.pial",
                "{subjects_dir}/{subject_id}/surf/rh.pial",
            ],
        )
        .resources(ResourceRequest {
            cpus: Some(surface.openmp),
            ..ResourceRequest::default()
        });

    let convert = |name: &str, hemi: &str| {
        NodeTemplate::new(name, "mris_convert")
            .args(["{surface}", "{mesh}"])
            .input("surface", SlotKind::File)
            .param("mesh_format", surface.mesh_format.clone())
            .output("mesh", format!("{}.pial.{{mesh_format}}", hemi))
    };

    let combine = NodeTemplate::new("combine", "mris_convert")
        .args(["--combinesurfs", "{in_files}", "{mesh}"])
        .input("in_files", SlotKind::FileList)
        .param("mesh_format", surface.mesh_format.clone())
        .output("mesh", "bh.{mesh_format}");

    PipelineBuilder::new("surface")
        .axis(SUBJECT_AXIS, config.subject_ids.clone())
        .node(recon)
        .node(convert("lh_convert", "lh"))
        .node(convert("rh_convert", "rh"))
        .node(combine)
        .select(("recon", "pial"), ("lh_convert", "surface"), Transform::left_hemisphere())
        .select(("recon", "pial"), ("rh_convert", "surface"), Transform::right_hemisphere())
        .pack([("rh_convert", "mesh"), ("lh_convert", "mesh")], ("combine", "in_files"))
        .sink("lh_mesh", ("lh_convert", "mesh"))
        .sink("rh_mesh", ("rh_convert", "mesh"))
        .sink("full_mesh", ("combine", "mesh"))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surface_pipeline_shape() {
        let config = RunConfig {
            subject_ids: vec!["klb".into()],
            ..RunConfig::default()
        };
        let pipeline = surface_pipeline(&config);

        assert_eq!(pipeline.axes[0].values, vec!["klb"]);
        assert_eq!(pipeline.nodes.len(), 4);
        assert_eq!(pipeline.sinks.len(), 3);

        let recon = pipeline.node("recon").unwrap();
        assert_eq!(recon.params["openmp"], "4");
        assert_eq!(recon.resources.cpus, Some(4));

        let lh = pipeline.node("lh_convert").unwrap();
        assert_eq!(lh.output_slot("mesh").unwrap().paths, vec!["lh.pial.{mesh_format}"]);

        let pack = pipeline
            .connections
            .iter()
            .find(|c| c.target.node == "combine")
            .unwrap();
        assert_eq!(pack.sources[0].node, "rh_convert");
        assert_eq!(pack.transform, Transform::PackList);
    }
}
