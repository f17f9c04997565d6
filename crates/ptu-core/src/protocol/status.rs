//! Device-reported status codes and their labels.

use super::Generation;

/// Status code reported for a successful command.
pub const STATUS_SUCCESS: u8 = 0x00;

const PIP2_STATUS_LABELS: [&str; 25] = [
    "Successful Completion of Command",
    "Busy",
    "Initialization Failure",
    "File Already Open",
    "File Not Open",
    "I/O Failure",
    "Unknown IOCTL",
    "Bad Address",
    "Bad File Name",
    "End of File",
    "Too Many Files",
    "Timeout",
    "Aborted",
    "Bad CRC",
    "Unknown Record Type",
    "Bad Frame",
    "No Permission",
    "Unknown Command",
    "Invalid Parameters",
    "I/O Already Active",
    "I/O Aborted due to Shutdown",
    "Invalid Image",
    "Unknown Register",
    "Bad Length",
    "Trim Failure",
];

const PIP3_STATUS_LABELS: [&str; 29] = [
    "Successful Completion of Command",
    "Command Failed to Complete",
    "Initialization Failure",
    "File Already Open",
    "File Not Open",
    "I/O Failure",
    "Unknown IOCTL",
    "Bad Address",
    "Bad File Name",
    "End of File",
    "Too Many Files",
    "Timeout",
    "Aborted",
    "Bad CRC",
    "Unknown Record Type",
    "Bad Frame",
    "No Permission",
    "Unknown Command",
    "Invalid Parameters",
    "I/O Already Active",
    "I/O Aborted due to Shutdown",
    "Invalid Image",
    "Unknown Register",
    "Bad Length",
    "Trim Failure",
    "Configuration Data Error",
    "Calibration Data Error",
    "Incompatible DDI State or State Transition Encountered During Command",
    "Incorrect System Mode to Execute Command",
];

/// Human-readable label for a status code of the given generation.
pub fn status_label(generation: Generation, code: u8) -> &'static str {
    let table: &[&'static str] = match generation {
        Generation::Gen2 => &PIP2_STATUS_LABELS,
        Generation::Gen3 => &PIP3_STATUS_LABELS,
    };
    table
        .get(code as usize)
        .copied()
        .unwrap_or("Unknown Status Code")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_differ_by_generation() {
        assert_eq!(status_label(Generation::Gen2, 1), "Busy");
        assert_eq!(status_label(Generation::Gen3, 1), "Command Failed to Complete");
        assert_eq!(
            status_label(Generation::Gen3, 28),
            "Incorrect System Mode to Execute Command"
        );
    }

    #[test]
    fn test_out_of_range_label() {
        assert_eq!(status_label(Generation::Gen2, 25), "Unknown Status Code");
        assert_eq!(status_label(Generation::Gen3, 0xFF), "Unknown Status Code");
    }
}
