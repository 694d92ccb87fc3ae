//! Passive PE inspection (Windows).
//!
//! Maps the target with `DONT_RESOLVE_DLL_REFERENCES` so no module code runs
//! and no dependencies are resolved, then walks the import and export
//! directories of the mapped image. RVA arithmetic is valid because the
//! image is section-mapped, not opened as a flat data file.

use std::ffi::CStr;
use std::os::windows::ffi::OsStrExt;
use std::path::PathBuf;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{HMODULE, HANDLE};
use windows::Win32::System::LibraryLoader::{
    FreeLibrary, GetModuleFileNameW, LoadLibraryExW, DONT_RESOLVE_DLL_REFERENCES,
};

use super::{ModuleError, ModuleMetadata, ModuleRef};

const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_MOD_NOT_FOUND: u32 = 126;

pub(super) fn inspect(target: ModuleRef<'_>) -> Result<ModuleMetadata, ModuleError> {
    let (wide, display): (Vec<u16>, String) = match target {
        ModuleRef::Path(path) => (to_wide(path.as_os_str()), path.display().to_string()),
        ModuleRef::Name(name) => (
            name.encode_utf16().chain(std::iter::once(0)).collect(),
            name.to_string(),
        ),
    };

    let module = unsafe {
        LoadLibraryExW(
            PCWSTR(wide.as_ptr()),
            HANDLE::default(),
            DONT_RESOLVE_DLL_REFERENCES,
        )
    }
    .map_err(|e| {
        let win32 = (e.code().0 as u32) & 0xFFFF;
        match win32 {
            ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND | ERROR_MOD_NOT_FOUND => {
                ModuleError::NotFound(display.clone())
            }
            _ => ModuleError::LoadFailed(format!("{display}: {e}")),
        }
    })?;

    let metadata = unsafe { read_metadata(module) };
    unsafe {
        let _ = FreeLibrary(module);
    }
    metadata
}

unsafe fn read_metadata(module: HMODULE) -> Result<ModuleMetadata, ModuleError> {
    let mut metadata = ModuleMetadata {
        resolved_path: resolved_path(module),
        ..Default::default()
    };

    let base = module.0 as usize;
    let Some(directories) = data_directories(base) else {
        return Err(ModuleError::LoadFailed("not a PE image".to_string()));
    };

    // Directory 1: imports.
    if directories[1].rva != 0 {
        let mut descriptor = (base + directories[1].rva as usize) as *const ImportDescriptor;
        while (*descriptor).name_rva != 0 {
            let name = CStr::from_ptr((base + (*descriptor).name_rva as usize) as *const i8);
            if let Ok(name) = name.to_str() {
                metadata.dependencies.push(name.to_string());
            }
            descriptor = descriptor.add(1);
        }
    }

    // Directory 0: exports.
    if directories[0].rva != 0 {
        let exports = &*((base + directories[0].rva as usize) as *const ExportDirectory);
        let names = (base + exports.address_of_names as usize) as *const u32;
        for index in 0..exports.number_of_names as usize {
            let name_rva = *names.add(index);
            let name = CStr::from_ptr((base + name_rva as usize) as *const i8);
            if let Ok(name) = name.to_str() {
                metadata.exports.push(name.to_string());
            }
        }
    }

    Ok(metadata)
}

/// Export and import directory entries of the mapped image.
unsafe fn data_directories(base: usize) -> Option<[DataDirectory; 2]> {
    const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
    const NT_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
    const PE32_PLUS: u16 = 0x20B;
    const PE32: u16 = 0x10B;

    if *(base as *const u16) != DOS_MAGIC {
        return None;
    }
    let e_lfanew = *((base + 0x3C) as *const i32);
    let nt = base + e_lfanew as usize;
    if *(nt as *const u32) != NT_SIGNATURE {
        return None;
    }

    // Optional header follows the 4-byte signature and 20-byte file header.
    let optional = nt + 24;
    let magic = *(optional as *const u16);
    let directory_offset = match magic {
        PE32_PLUS => 112,
        PE32 => 96,
        _ => return None,
    };

    let entries = (optional + directory_offset) as *const DataDirectory;
    Some([*entries, *entries.add(1)])
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct DataDirectory {
    rva: u32,
    size: u32,
}

unsafe fn resolved_path(module: HMODULE) -> Option<PathBuf> {
    let mut buffer = [0u16; 1024];
    let length = GetModuleFileNameW(module, &mut buffer) as usize;
    if length == 0 {
        return None;
    }
    Some(PathBuf::from(String::from_utf16_lossy(&buffer[..length])))
}

fn to_wide(value: &std::ffi::OsStr) -> Vec<u16> {
    value.encode_wide().chain(std::iter::once(0)).collect()
}

// Minimal image structures; only the fields walked above matter.
#[repr(C)]
#[allow(dead_code)]
struct ImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name_rva: u32,
    first_thunk: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct ExportDirectory {
    characteristics: u32,
    time_date_stamp: u32,
    major_version: u16,
    minor_version: u16,
    name: u32,
    base: u32,
    number_of_functions: u32,
    number_of_names: u32,
    address_of_functions: u32,
    address_of_names: u32,
    address_of_name_ordinals: u32,
}
