// 🔤 Name Fingerprints - canonical "smash" strings for name clustering
//
// A fingerprint keeps only the ASCII letters of the uppercased name, each
// letter once, in order of first occurrence:
//   "Jennifer Doolittle" → "JENIFRDOLT"

/// Reduce a free-text name to its canonical fingerprint.
///
/// Uppercasing is full Unicode (`ß` → `SS`, `ı` → `I`) and happens first;
/// whatever is not an ASCII letter afterwards is dropped, not replaced.
pub fn canonicalize_name(name: &str) -> String {
    let mut seen = [false; 26];
    let mut fingerprint = String::with_capacity(26);

    for upper in name.chars().flat_map(char::to_uppercase) {
        if !upper.is_ascii_uppercase() {
            continue;
        }
        let slot = (upper as u8 - b'A') as usize;
        if !seen[slot] {
            seen[slot] = true;
            fingerprint.push(upper);
        }
    }

    fingerprint
}
