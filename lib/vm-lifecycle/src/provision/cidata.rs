// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Cursor, Write};

use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};

use super::ProvisionError;

const SECTOR_SZ: usize = 512;
const VOLUME_LABEL: [u8; 11] = *b"cidata     ";

/// Builds a FAT volume labelled `cidata` holding the given files, for
/// cloud-init's NoCloud datasource.
///
/// Files with empty contents are left out.
pub fn build_cidata_image(
    files: &[(&str, Vec<u8>)],
) -> Result<Vec<u8>, ProvisionError> {
    let err = |e: std::io::Error| ProvisionError::Cidata(e.to_string());

    let file_sectors: usize =
        files.iter().map(|(_, data)| data.len().div_ceil(SECTOR_SZ)).sum();
    // Seed data is a few small text files; anything larger is a mistake.
    if file_sectors > 512 {
        return Err(ProvisionError::Cidata(format!(
            "too much vfat data: {file_sectors} > 512 sectors"
        )));
    }

    // FAT12 metadata costs 37 sectors at this size; fatfs will not format
    // fewer than 42.
    let sectors = 42.max(file_sectors + 37);

    // One track spanning the whole volume keeps the geometry consistent.
    let sectors_per_track = u16::try_from(sectors)
        .map_err(|_| ProvisionError::Cidata(format!("{sectors} sectors")))?;

    let mut disk = Cursor::new(vec![0; sectors * SECTOR_SZ]);
    fatfs::format_volume(
        &mut disk,
        FormatVolumeOptions::new()
            .bytes_per_cluster(512)
            .sectors_per_track(sectors_per_track)
            .fat_type(fatfs::FatType::Fat12)
            .volume_label(VOLUME_LABEL),
    )
    .map_err(err)?;

    {
        let fs = FileSystem::new(&mut disk, FsOptions::new()).map_err(err)?;
        let root_dir = fs.root_dir();
        for (name, data) in files.iter().filter(|(_, d)| !d.is_empty()) {
            root_dir
                .create_file(name)
                .and_then(|mut f| f.write_all(data))
                .map_err(err)?;
        }
    }

    Ok(disk.into_inner())
}
