//! File naming and folder housekeeping for generation jobs.
//!
//! Every job gets its own folder under the stepwise output directory. The
//! backend writes per-step frames and a running composite there; once the
//! job is done only the composite is kept.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Inserts `_<index>` before the extension of the final path component.
///
/// `outputs/gen_img.png` with index 3 becomes `outputs/gen_img_3.png`; a path
/// without an extension just gets the suffix appended.
pub fn indexed_output_path(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(file_name)
}

/// Working folder of the job with the given index.
pub fn job_folder(root: &Path, index: usize) -> PathBuf {
    root.join(format!("img_{index}"))
}

/// Creates `folder` if it is missing, otherwise removes the files left in it
/// by a previous run. Subdirectories are left alone.
pub fn prepare_folder(folder: &Path) -> io::Result<()> {
    if !folder.exists() {
        fs::create_dir_all(folder)?;
        #[cfg(target_os = "macos")]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(folder, fs::Permissions::from_mode(0o777))?;
        }
        return Ok(());
    }
    remove_files_matching(folder, |_| true).map(|_| ())
}

/// First regular file in `folder` whose name ends with `suffix`.
pub fn find_file_with_suffix(folder: &Path, suffix: &str) -> io::Result<Option<PathBuf>> {
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let matches = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(suffix));
        if matches && entry.file_type()?.is_file() {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Deletes every regular file in `folder` whose name does not end with
/// `suffix`. Returns how many files were removed.
pub fn remove_files_except_suffix(folder: &Path, suffix: &str) -> io::Result<usize> {
    remove_files_matching(folder, |name| !name.ends_with(suffix))
}

fn remove_files_matching(folder: &Path, doomed: impl Fn(&str) -> bool) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if doomed(&entry.file_name().to_string_lossy()) {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_goes_before_the_extension() {
        assert_eq!(
            indexed_output_path(Path::new("outputs/gen_img.png"), 3),
            PathBuf::from("outputs/gen_img_3.png")
        );
        assert_eq!(
            indexed_output_path(Path::new("img.png"), 0),
            PathBuf::from("img_0.png")
        );
    }

    #[test]
    fn dots_in_directories_are_preserved() {
        assert_eq!(
            indexed_output_path(Path::new("runs/v1.2/out.jpeg"), 1),
            PathBuf::from("runs/v1.2/out_1.jpeg")
        );
        assert_eq!(
            indexed_output_path(Path::new("runs/v1.2/out"), 7),
            PathBuf::from("runs/v1.2/out_7")
        );
    }

    #[test]
    fn job_folders_are_numbered() {
        assert_eq!(
            job_folder(Path::new("output_stepwise"), 2),
            PathBuf::from("output_stepwise/img_2")
        );
    }

    #[test]
    fn prepare_creates_then_empties() {
        let root = tempfile::tempdir().unwrap();
        let folder = root.path().join("stepwise").join("img_0");

        prepare_folder(&folder).unwrap();
        assert!(folder.is_dir());

        fs::write(folder.join("seed_1_step1of4.png"), b"frame").unwrap();
        fs::create_dir(folder.join("nested")).unwrap();
        prepare_folder(&folder).unwrap();

        let left: Vec<_> = fs::read_dir(&folder)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("nested")]);
    }

    #[test]
    fn suffix_lookup_and_cleanup() {
        let folder = tempfile::tempdir().unwrap();
        let dir = folder.path();
        assert_eq!(find_file_with_suffix(dir, "_composite.png").unwrap(), None);

        fs::write(dir.join("seed_9_step1of2.png"), b"a").unwrap();
        fs::write(dir.join("seed_9_step2of2.png"), b"b").unwrap();
        fs::write(dir.join("seed_9_composite.png"), b"ab").unwrap();

        assert_eq!(
            find_file_with_suffix(dir, "_composite.png").unwrap(),
            Some(dir.join("seed_9_composite.png"))
        );
        assert_eq!(remove_files_except_suffix(dir, "_composite.png").unwrap(), 2);
        assert!(dir.join("seed_9_composite.png").exists());
        assert!(!dir.join("seed_9_step1of2.png").exists());
    }
}
