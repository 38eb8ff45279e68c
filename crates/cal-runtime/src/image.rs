//! Compiled kernel images

use crate::device::{Device, Runtime};
use crate::driver::{ImageId, Target};
use crate::error::{CalError, Result};

/// Compiled and linked kernel program
///
/// Independent of any execution: an image may be freed while launches that loaded it
/// are still in flight.
#[derive(Debug, PartialEq, Eq)]
pub struct KernelImage {
    id: ImageId,
    target: Target,
}

impl KernelImage {
    pub fn id(&self) -> ImageId {
        self.id
    }

    /// Device target the image was compiled for
    pub fn target(&self) -> Target {
        self.target
    }
}

impl Runtime {
    /// Compile IL source for the target of device 0
    pub fn compile(&self, source: &str) -> Result<KernelImage> {
        let device = self.device(0)?;
        self.compile_for(&device, source)
    }

    /// Compile IL source for `device`'s target
    pub fn compile_for(&self, device: &Device, source: &str) -> Result<KernelImage> {
        self.check_device(device)?;
        let target = device.info().target;
        let id = self.driver.compile(source, target).map_err(CalError::execution)?;
        tracing::debug!(image = %id, target = target.0, bytes = source.len(), "compiled kernel image");
        Ok(KernelImage { id, target })
    }

    /// Release a compiled image
    pub fn free_image(&self, image: KernelImage) -> Result<()> {
        self.driver.free_image(image.id).map_err(CalError::execution)?;
        tracing::debug!(image = %image.id, "freed kernel image");
        Ok(())
    }
}
