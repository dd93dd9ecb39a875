//! Frame smoothing and foreground region extraction

use std::collections::VecDeque;

/// 5-tap binomial kernel, a close approximation of a 5x5 Gaussian when applied
/// separably.
const KERNEL: [f32; 5] = [1.0, 4.0, 6.0, 4.0, 1.0];
const KERNEL_SUM: f32 = 16.0;

/// Blur a grayscale buffer with the binomial kernel, clamping at the borders
pub fn smooth(width: u32, height: u32, pixels: &[u8]) -> Vec<f32> {
    let (w, h) = (width as usize, height as usize);
    let mut horizontal = vec![0.0f32; w * h];

    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                let sx = (x as isize + k as isize - 2).clamp(0, w as isize - 1) as usize;
                acc += weight * pixels[y * w + sx] as f32;
            }
            horizontal[y * w + x] = acc / KERNEL_SUM;
        }
    }

    let mut out = vec![0.0f32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                let sy = (y as isize + k as isize - 2).clamp(0, h as isize - 1) as usize;
                acc += weight * horizontal[sy * w + x];
            }
            out[y * w + x] = acc / KERNEL_SUM;
        }
    }
    out
}

#[rustfmt::skip]
const NEIGHBORS: [(isize, isize); 8] = [
    (-1, -1), (-1, 0), (-1, 1),
    (0, -1),           (0, 1),
    (1, -1),  (1, 0),  (1, 1),
];

/// Areas (pixel counts) of every 8-connected foreground region, largest first
pub fn region_areas(width: u32, height: u32, mask: &[bool]) -> Vec<u32> {
    let (w, h) = (width as isize, height as isize);
    let mut visited = vec![false; mask.len()];
    let mut areas = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }

        visited[start] = true;
        queue.push_back(start);
        let mut area = 0u32;

        while let Some(idx) = queue.pop_front() {
            area += 1;
            let (x, y) = ((idx as isize) % w, (idx as isize) / w);

            for (dx, dy) in NEIGHBORS {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w || ny >= h {
                    continue;
                }
                let n = (ny * w + nx) as usize;
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            }
        }
        areas.push(area);
    }

    areas.sort_unstable_by(|a, b| b.cmp(a));
    areas
}
