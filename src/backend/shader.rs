// Shader module loading
//
// Vulkan consumes SPIR-V words. Files are validated at read time so a bad
// binary fails with the offending path instead of deep inside the driver.

use ash::vk;
use std::io::{self, Cursor};
use std::path::Path;

use super::device::Device;
use super::error::{RenderError, RenderResult, VkResultExt};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into words. Byte-swapped binaries are accepted.
pub fn decode_spirv(bytes: &[u8]) -> io::Result<Vec<u32>> {
    if bytes.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty SPIR-V binary"));
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes))?;
    if words.first() != Some(&SPIRV_MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing SPIR-V magic number",
        ));
    }
    Ok(words)
}

/// Read and decode a SPIR-V file.
pub fn read_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let io_error = |source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = std::fs::read(path).map_err(io_error)?;
    decode_spirv(&bytes).map_err(io_error)
}

pub fn create_shader_module(device: &Device, code: &[u32]) -> RenderResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
    unsafe { device.device.create_shader_module(&create_info, None) }
        .fatal("create_shader_module")
}

/// Read a SPIR-V file and wrap it in a shader module.
pub fn load_shader(device: &Device, path: &Path) -> RenderResult<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {} ({} words)", path.display(), code.len());
    create_shader_module(device, &code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_to_bytes(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_little_endian_words() {
        let bytes = words_to_bytes(&[SPIRV_MAGIC, 0x0001_0000, 7]);
        assert_eq!(decode_spirv(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000, 7]);
    }

    #[test]
    fn rejects_empty_misaligned_and_foreign_files() {
        assert_eq!(
            decode_spirv(&[]).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        let mut misaligned = words_to_bytes(&[SPIRV_MAGIC, 1]);
        misaligned.pop();
        assert!(decode_spirv(&misaligned).is_err());

        let text = b"#version 450\n\0\0\0";
        assert_eq!(
            decode_spirv(text).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let path = Path::new("shaders/does_not_exist.spv");
        match read_spirv(path) {
            Err(RenderError::Io { path: p, source }) => {
                assert_eq!(p, path);
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }
}
