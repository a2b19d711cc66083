//! Five-point face alignment to the ArcFace 112×112 template.

use image::{Rgb, RgbImage};

pub const ALIGNED_SIZE: u32 = 112;

/// ArcFace template landmarks in a 112×112 crop.
const TEMPLATE: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Similarity transform `dst = [a -b; b a] · src + (tx, ty)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit of `src` onto `dst`.
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let mean = |pts: &[(f32, f32); 5]| {
            let (sx, sy) = pts.iter().fold((0.0, 0.0), |(x, y), p| (x + p.0, y + p.1));
            (sx / 5.0, sy / 5.0)
        };
        let (mpx, mpy) = mean(src);
        let (mqx, mqy) = mean(dst);

        let (mut dot, mut cross, mut energy) = (0.0f32, 0.0f32, 0.0f32);
        for (p, q) in src.iter().zip(dst) {
            let (px, py) = (p.0 - mpx, p.1 - mpy);
            let (qx, qy) = (q.0 - mqx, q.1 - mqy);
            dot += px * qx + py * qy;
            cross += px * qy - py * qx;
            energy += px * px + py * py;
        }
        if energy <= f32::EPSILON {
            return Self {
                a: 1.0,
                b: 0.0,
                tx: mqx - mpx,
                ty: mqy - mpy,
            };
        }

        let a = dot / energy;
        let b = cross / energy;
        Self {
            a,
            b,
            tx: mqx - (a * mpx - b * mpy),
            ty: mqy - (b * mpx + a * mpy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    fn invert(&self, (x, y): (f32, f32)) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det <= f32::EPSILON {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some(((self.a * dx + self.b * dy) / det, (-self.b * dx + self.a * dy) / det))
    }
}

/// Warp the face described by `landmarks` into a canonical 112×112 crop.
pub fn align_face(frame: &RgbImage, landmarks: &[(f32, f32); 5]) -> RgbImage {
    let transform = Similarity::estimate(landmarks, &TEMPLATE);
    RgbImage::from_fn(ALIGNED_SIZE, ALIGNED_SIZE, |ox, oy| {
        match transform.invert((ox as f32, oy as f32)) {
            Some((sx, sy)) => bilinear(frame, sx, sy),
            None => Rgb([0, 0, 0]),
        }
    })
}

/// Bilinear sample; outside the frame reads as black.
fn bilinear(frame: &RgbImage, x: f32, y: f32) -> Rgb<u8> {
    let (x0, y0) = (x.floor(), y.floor());
    let (fx, fy) = (x - x0, y - y0);
    let at = |px: f32, py: f32| -> [f32; 3] {
        if px < 0.0 || py < 0.0 || px >= frame.width() as f32 || py >= frame.height() as f32 {
            return [0.0; 3];
        }
        let p = frame.get_pixel(px as u32, py as u32);
        [p[0] as f32, p[1] as f32, p[2] as f32]
    };
    let (tl, tr, bl, br) = (at(x0, y0), at(x0 + 1.0, y0), at(x0, y0 + 1.0), at(x0 + 1.0, y0 + 1.0));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let v = tl[c] * (1.0 - fx) * (1.0 - fy)
            + tr[c] * fx * (1.0 - fy)
            + bl[c] * (1.0 - fx) * fy
            + br[c] * fx * fy;
        out[c] = v.round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fit() {
        let t = Similarity::estimate(&TEMPLATE, &TEMPLATE);
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_scaled_and_shifted_fit() {
        let src = TEMPLATE.map(|(x, y)| (x * 2.0 + 30.0, y * 2.0 + 10.0));
        let t = Similarity::estimate(&src, &TEMPLATE);
        assert!((t.a - 0.5).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4);
        for (s, d) in src.iter().zip(&TEMPLATE) {
            let (x, y) = t.apply(*s);
            assert!((x - d.0).abs() < 1e-2 && (y - d.1).abs() < 1e-2);
        }
    }

    #[test]
    fn test_rotation_fit() {
        // 90° rotation about the origin: (x, y) -> (-y, x).
        let src = TEMPLATE.map(|(x, y)| (y, -x));
        let t = Similarity::estimate(&src, &TEMPLATE);
        assert!(t.a.abs() < 1e-4);
        assert!((t.b - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_invert_roundtrip() {
        let t = Similarity {
            a: 0.8,
            b: 0.3,
            tx: 5.0,
            ty: -2.0,
        };
        let p = (12.0, 7.5);
        let back = t.invert(t.apply(p)).unwrap();
        assert!((back.0 - p.0).abs() < 1e-4 && (back.1 - p.1).abs() < 1e-4);
    }

    #[test]
    fn test_aligned_crop_size_and_content() {
        let frame = RgbImage::from_pixel(224, 224, Rgb([200, 100, 50]));
        let landmarks = TEMPLATE.map(|(x, y)| (x * 2.0, y * 2.0));
        let crop = align_face(&frame, &landmarks);
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(*crop.get_pixel(56, 56), Rgb([200, 100, 50]));
    }
}
