//! Stages both engines share after reconstruction.
//!
//! They register the reconstruction to the corrected T1w, resample the
//! segmentations into native space and export surfaces as GIFTI.

use crate::config::ToolPaths;
use crate::core::{ArtifactKey, Hemisphere, SurfaceKind};
use crate::stages::{CommandStage, RunnableStage, StageDescriptor};
use std::sync::Arc;

/// Artifacts every engine must produce.
#[must_use]
pub fn output_contract() -> Vec<ArtifactKey> {
    let mut contract = vec![
        ArtifactKey::SubjectDir,
        ArtifactKey::FsnativeToT1w,
        ArtifactKey::T1wToFsnative,
    ];
    for hemi in Hemisphere::BOTH {
        contract.extend(SurfaceKind::ALL.map(|kind| ArtifactKey::Surface(hemi, kind)));
    }
    contract.extend([ArtifactKey::Aseg, ArtifactKey::AparcAseg]);
    contract
}

fn fsnative_to_t1w(tools: &ToolPaths) -> CommandStage {
    CommandStage::new(
        StageDescriptor::new("fsnative2t1w_xfm")
            .with_inputs([ArtifactKey::ReconT1, ArtifactKey::CorrectedT1w])
            .with_output(ArtifactKey::FsnativeToT1w),
        &tools.robust_register,
    )
    .arg("--mov")
    .input(ArtifactKey::ReconT1)
    .arg("--dst")
    .input(ArtifactKey::CorrectedT1w)
    .arg("--lta")
    .output(ArtifactKey::FsnativeToT1w)
    .args(["--satit", "--iscale"])
}

fn t1w_to_fsnative(tools: &ToolPaths) -> CommandStage {
    CommandStage::new(
        StageDescriptor::new("t1w2fsnative_xfm")
            .with_input(ArtifactKey::FsnativeToT1w)
            .with_output(ArtifactKey::T1wToFsnative),
        &tools.lta_convert,
    )
    .arg("--inlta")
    .input(ArtifactKey::FsnativeToT1w)
    .arg("--outlta")
    .output(ArtifactKey::T1wToFsnative)
    .arg("--invert")
}

fn seg_to_native(tools: &ToolPaths, name: &str, source: ArtifactKey, target: ArtifactKey) -> CommandStage {
    CommandStage::new(
        StageDescriptor::new(name)
            .with_inputs([source.clone(), ArtifactKey::CorrectedT1w, ArtifactKey::FsnativeToT1w])
            .with_output(target.clone()),
        &tools.vol2vol,
    )
    .arg("--mov")
    .input(source)
    .arg("--targ")
    .input(ArtifactKey::CorrectedT1w)
    .arg("--lta")
    .input(ArtifactKey::FsnativeToT1w)
    .arg("--o")
    .output(target)
    .args(["--interp", "nearest"])
}

fn midthickness(tools: &ToolPaths, hemi: Hemisphere) -> CommandStage {
    let white = ArtifactKey::ReconSurface(hemi, SurfaceKind::White);
    let mid = ArtifactKey::ReconSurface(hemi, SurfaceKind::Midthickness);
    CommandStage::new(
        StageDescriptor::new(format!("midthickness_{hemi}"))
            .with_input(white.clone())
            .with_output(mid.clone())
            .with_partition(hemi),
        &tools.mris_expand,
    )
    .arg("-thickness")
    .input(white)
    .arg("0.5")
    .output(mid)
}

fn gifti(tools: &ToolPaths, hemi: Hemisphere, kind: SurfaceKind) -> CommandStage {
    let source = ArtifactKey::ReconSurface(hemi, kind);
    let target = ArtifactKey::Surface(hemi, kind);
    CommandStage::new(
        StageDescriptor::new(format!("gifti_{hemi}_{}", kind.suffix()))
            .with_input(source.clone())
            .with_output(target.clone())
            .with_partition(hemi),
        &tools.mris_convert,
    )
    .arg("--to-scanner")
    .input(source)
    .output(target)
}

/// Builds the shared post-reconstruction stages.
#[must_use]
pub fn common_stages(tools: &ToolPaths) -> Vec<Arc<dyn RunnableStage>> {
    let mut stages: Vec<Arc<dyn RunnableStage>> = vec![
        Arc::new(fsnative_to_t1w(tools)),
        Arc::new(t1w_to_fsnative(tools)),
        Arc::new(seg_to_native(tools, "aseg_to_native", ArtifactKey::ReconAseg, ArtifactKey::Aseg)),
        Arc::new(seg_to_native(
            tools,
            "aparc_to_native",
            ArtifactKey::ReconAparcAseg,
            ArtifactKey::AparcAseg,
        )),
    ];
    for hemi in Hemisphere::BOTH {
        stages.push(Arc::new(midthickness(tools, hemi)));
        for kind in SurfaceKind::ALL {
            stages.push(Arc::new(gifti(tools, hemi, kind)));
        }
    }
    stages
}
