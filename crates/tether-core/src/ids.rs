/// Generate a random identifier (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}
