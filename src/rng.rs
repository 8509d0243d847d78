/// Seeded mulberry32 die, so simulated games replay exactly.
#[derive(Clone, Debug)]
pub struct SeededDice {
    seed: u32,
    faces: u32,
}

impl SeededDice {
    pub fn new(seed: u32, faces: u32) -> Self {
        Self {
            seed,
            faces: faces.max(1),
        }
    }

    pub fn next_f32(&mut self) -> f32 {
        self.seed = self.seed.wrapping_add(0x6d2b79f5);
        let mut t = self.seed;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        let out = t ^ (t >> 14);
        (out as f64 / 4_294_967_296.0) as f32
    }

    /// Uniform value in `1..=faces`.
    pub fn roll(&mut self) -> u32 {
        let value = (self.next_f32() * self.faces as f32).floor() as u32 + 1;
        value.min(self.faces)
    }
}
