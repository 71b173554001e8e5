//! Re-chunking of a batch into fixed-length raw segments.

use crate::error::{PipelineError, Result};
use crate::layout::{SegmentId, Workspace};
use crate::storage::{self, staging_path};
use ndarray::{s, Array2, ArrayView2};
use tracing::{info, warn};

/// Split `data` into consecutive windows of `samples_per_segment` frames.
/// A trailing remainder shorter than one window is dropped.
pub fn chunk_segments(
    data: &Array2<i16>,
    samples_per_segment: usize,
) -> impl Iterator<Item = ArrayView2<'_, i16>> {
    let n_segments = if samples_per_segment == 0 {
        0
    } else {
        data.nrows() / samples_per_segment
    };
    (0..n_segments).map(move |i| {
        let start = i * samples_per_segment;
        data.slice(s![start..start + samples_per_segment, ..])
    })
}

/// Write every segment of a batch under `raw/<block>`.
///
/// Segments are written into a hidden staging directory that is renamed
/// into place once complete. Returns the number of segments written.
pub fn materialize_block(
    workspace: &Workspace,
    block: &str,
    data: &Array2<i16>,
    samples_per_segment: usize,
) -> Result<usize> {
    let target = workspace.block_raw_dir(block);
    let staged = staging_path(&target);
    std::fs::create_dir_all(&staged).map_err(PipelineError::io(&staged))?;

    let mut written = 0;
    for (i, window) in chunk_segments(data, samples_per_segment).enumerate() {
        let segment = SegmentId::new(block, (i + 1) as u32);
        let path = staged.join(segment.file_name());
        if let Err(e) = storage::write_samples(&path, &window.to_owned()) {
            let _ = std::fs::remove_dir_all(&staged);
            return Err(e);
        }
        written += 1;
    }

    let dropped = data.nrows() - written * samples_per_segment;
    if written == 0 {
        warn!(block, n_frames = data.nrows(), "batch is shorter than one segment");
    } else if dropped > 0 {
        info!(block, dropped_frames = dropped, "dropped trailing partial segment");
    }

    storage::commit(&staged, &target)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_drops_remainder() {
        let data = Array2::from_shape_fn((25, 2), |(t, c)| (t * 2 + c) as i16);
        let windows: Vec<_> = chunk_segments(&data, 10).collect();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1][[0, 0]], 20);
        assert_eq!(windows[1].nrows(), 10);
    }

    #[test]
    fn test_materialize_writes_dense_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        ws.ensure_directories().unwrap();

        let data = Array2::from_shape_fn((35, 3), |(t, _)| t as i16);
        assert_eq!(materialize_block(&ws, "b1", &data, 10).unwrap(), 3);

        let segments = ws.raw_segments("b1").unwrap();
        assert_eq!(
            segments.iter().map(|s| s.number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let third = storage::read_samples(&ws.block_raw_dir("b1").join("segment_003.bin"), 3)
            .unwrap();
        assert_eq!(third[[0, 0]], 20);
        assert!(storage::info_path(&ws.block_raw_dir("b1").join("segment_001.bin")).exists());

        // only the committed block is visible
        assert_eq!(ws.raw_blocks().unwrap(), vec!["b1"]);
    }
}
