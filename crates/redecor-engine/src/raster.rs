use image::RgbImage;

macro_rules! rgb_raster {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(RgbImage);

        impl $name {
            pub fn new(image: RgbImage) -> Self {
                Self(image)
            }

            pub fn as_rgb(&self) -> &RgbImage {
                &self.0
            }

            pub fn into_rgb(self) -> RgbImage {
                self.0
            }

            pub fn dimensions(&self) -> (u32, u32) {
                self.0.dimensions()
            }
        }
    };
}

rgb_raster!(
    /// Decoded upload, always 3-channel 8-bit RGB.
    CanonicalImage
);

rgb_raster!(
    /// Structural features of a canonical image (white lines on black).
    ConditioningImage
);

rgb_raster!(OutputImage);
