use crate::DiscreteRoi;

/// Owned 8-bit grayscale image.
///
/// `stride` is the number of bytes per row and may exceed `width` when the
/// buffer came from a driver with row padding.
#[derive(Clone)]
pub struct GrayImage {
    width: u32,
    height: u32,
    stride: u32,
    data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, stride: u32, data: Vec<u8>) -> crate::Result<Self> {
        if stride < width {
            return Err("stride smaller than width".into());
        }
        if data.len() != stride as usize * height as usize {
            return Err("buffer length does not match stride * height".into());
        }
        Ok(Self {
            width,
            height,
            stride,
            data,
        })
    }

    /// Image filled with a constant value, tightly packed.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            stride: width,
            data: vec![value; width as usize * height as usize],
        }
    }

    /// Build an image from a per-pixel function, tightly packed.
    pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> u8,
    {
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            stride: width,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }
    #[inline]
    pub fn stride(&self) -> u32 {
        self.stride
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        debug_assert!(x < self.width && y < self.height);
        self.data[y as usize * self.stride as usize + x as usize]
    }

    #[inline]
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.width as usize]
    }

    /// Copy out the region of `roi`, clamped to the image bounds.
    ///
    /// The result is tightly packed. An ROI entirely outside the image yields
    /// an empty 0x0 image.
    pub fn crop(&self, roi: &DiscreteRoi) -> GrayImage {
        let x0 = roi.x.min(self.width);
        let y0 = roi.y.min(self.height);
        let x1 = roi.x.saturating_add(roi.w).min(self.width);
        let y1 = roi.y.saturating_add(roi.h).min(self.height);
        let (w, h) = (x1 - x0, y1 - y0);
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y1 {
            let start = y as usize * self.stride as usize + x0 as usize;
            data.extend_from_slice(&self.data[start..start + w as usize]);
        }
        GrayImage {
            width: w,
            height: h,
            stride: w,
            data,
        }
    }
}

impl std::fmt::Debug for GrayImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrayImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish_non_exhaustive()
    }
}

impl PartialEq for GrayImage {
    fn eq(&self, other: &GrayImage) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        // compare row-wise so differing strides still compare equal
        (0..self.height).all(|y| self.row(y) == other.row(y))
    }
}
