//! Brain-mask refinement scenarios, in memory and through the stage.

use pretty_assertions::assert_eq;
use reconflow::core::{ArtifactKey, Frame, StageStatus};
use reconflow::errors::ReconflowError;
use reconflow::events::NoOpEventSink;
use reconflow::refine::{
    refine_brain_mask, segmentation_mask, Affine, Confidence, FileVolumeCodec, IntensityVolume, LabelVolume, Mask,
    NiftiVolumeCodec, RefineConfig, RefineMaskStage, Volume, VolumeCodec,
};
use reconflow::stages::{RunnableStage, StageContext};
use reconflow::store::ArtifactStore;
use std::path::Path;
use std::sync::Arc;

const N: usize = 10;

fn filled<T: Copy>(shape: [usize; 3], value: T) -> Volume<T> {
    Volume::filled(shape, Frame::Native, Affine::identity(), value)
}

fn in_range(at: [usize; 3], lo: usize, hi: usize) -> bool {
    at.iter().all(|c| (lo..hi).contains(c))
}

/// A 4x4x4 core of label 3 with one unlabelled voxel inside.
fn core_with_hole() -> LabelVolume {
    let mut labels = filled([N, N, N], 0u16);
    for i in 0..labels.len() {
        let at = labels.coords(i);
        if in_range(at, 3, 7) {
            labels.set(at[0], at[1], at[2], 3);
        }
    }
    labels.set(4, 5, 4, 0);
    labels
}

fn core_mask() -> Mask {
    let mut mask = filled([N, N, N], false);
    for i in 0..mask.len() {
        let at = mask.coords(i);
        mask.set(at[0], at[1], at[2], in_range(at, 3, 7));
    }
    mask
}

fn context(root: &Path) -> StageContext {
    let store = Arc::new(ArtifactStore::new(root.join("fs")));
    store
        .register("sub-01", ArtifactKey::ExternalMask, root.join("anat/mask.nii.gz"))
        .unwrap();
    store
        .register("sub-01", ArtifactKey::CorrectedT1w, root.join("anat/t1w.nii.gz"))
        .unwrap();
    StageContext::new(store.subject("sub-01"), store, Arc::new(NoOpEventSink))
}

fn write_labels(path: &Path, labels: &LabelVolume) {
    NiftiVolumeCodec::new().write_labels(path, labels).unwrap();
}

fn write_intensity(path: &Path, anat: &IntensityVolume) {
    NiftiVolumeCodec::new().write_intensity(path, anat).unwrap();
}

#[tokio::test]
async fn test_core_with_hole_and_empty_external_mask() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    let labels = core_with_hole();
    write_labels(&dir.path().join("fs/sub-01/mri/aseg.native.nii.gz"), &labels);
    write_intensity(&dir.path().join("anat/t1w.nii.gz"), &labels.map(|l| if l == 0 { 10.0 } else { 100.0 }));
    FileVolumeCodec::new()
        .write_mask(&dir.path().join("anat/mask.nii.gz"), &filled([N, N, N], false))
        .unwrap();

    let stage = RefineMaskStage::new(Arc::new(FileVolumeCodec::new()), RefineConfig::default());
    let output = stage.execute(&ctx).await.unwrap();

    assert_eq!(output.status, StageStatus::Ok);
    assert_eq!(output.metadata["confidence"], serde_json::json!("low"));
    assert_eq!(output.metadata["band_voxels"], serde_json::json!(0));

    let written = FileVolumeCodec::new()
        .read_mask(output.artifact(&ArtifactKey::Brainmask).unwrap())
        .unwrap();
    assert_eq!(written.count(), 64);
    assert_eq!(written, core_mask());
}

#[test]
fn test_cavity_fill_changes_nothing_else() {
    // A hollow 8-voxel cube with an enclosed 2x2x2 cavity and a notch open to the outside.
    let mut labels = filled([N, N, N], 0u16);
    for i in 0..labels.len() {
        let at = labels.coords(i);
        if in_range(at, 1, 9) && !in_range(at, 4, 6) {
            labels.set(at[0], at[1], at[2], 2);
        }
    }
    labels.set(2, 2, 1, 0);
    labels.set(2, 2, 2, 0);

    let original = labels.map(|l| l != 0);
    let filled_mask = segmentation_mask(&labels, 0);

    for i in 0..original.len() {
        let at = original.coords(i);
        let expected = original.data()[i] || in_range(at, 4, 6);
        assert_eq!(filled_mask.data()[i], expected, "voxel {at:?}");
    }
    assert!(!filled_mask.get(2, 2, 1));
    assert_eq!(filled_mask.count(), original.count() + 8);
}

#[tokio::test]
async fn test_shape_mismatch_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path());
    write_labels(
        &dir.path().join("fs/sub-01/mri/aseg.native.nii.gz"),
        &filled([N, N, N + 1], 3u16),
    );
    write_intensity(&dir.path().join("anat/t1w.nii.gz"), &filled([N, N, N], 50.0f32));
    FileVolumeCodec::new()
        .write_mask(&dir.path().join("anat/mask.nii.gz"), &filled([N, N, N], true))
        .unwrap();

    let stage = RefineMaskStage::new(Arc::new(FileVolumeCodec::new()), RefineConfig::default());
    let err = stage.execute(&ctx).await.unwrap_err();

    match err {
        ReconflowError::FrameMismatch(e) => assert_eq!(e.input, "labels"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("fs/sub-01/mri/brainmask.consensus.nii.gz").exists());
}

#[test]
fn test_rerun_with_own_output_is_monotone() {
    let labels = core_with_hole();
    let anat = labels.map(|l| if l == 0 { 95.0f32 } else { 100.0 });
    let mut external = filled([N, N, N], false);
    external.set(2, 5, 5, true);
    external.set(8, 4, 4, true);
    let config = RefineConfig::default();

    let first = refine_brain_mask(&external, &labels, &anat, &config).unwrap();
    let second = refine_brain_mask(&first.mask, &labels, &anat, &config).unwrap();

    assert_eq!(first.confidence, Confidence::High);
    assert!(first.mask.is_subset_of(&second.mask));
    assert!(external.is_subset_of(&first.mask));
}
