use std::io::ErrorKind;

use smbioslib::*;

/// OEM string the firmware uses to announce the EC
const EC_OEM_STRING: &str = "IBM ThinkPad Embedded Controller";

/// Check whether the SMBIOS says this is a ThinkPad with the usual EC.
///
/// Most boards announce the EC in the OEM strings. Some old IBM boards
/// (A30, T23, X24) don't, but carry the model name in the product version.
pub fn is_thinkpad() -> bool {
    let smbios = if let Some(smbios) = get_smbios() {
        smbios
    } else {
        return false;
    };

    let mut oem_strings = vec![];
    let mut manufacturer = String::new();
    let mut version = String::new();
    for undefined_struct in smbios.iter() {
        match undefined_struct.defined_struct() {
            DefinedStruct::OemStrings(data) => {
                let strings = data.oem_strings();
                for i in 1..=data.count().unwrap_or(0) {
                    if let Some(s) = dmidecode_string_val(&strings.get_string(i)) {
                        oem_strings.push(s);
                    }
                }
            }
            DefinedStruct::SystemInformation(data) => {
                manufacturer = dmidecode_string_val(&data.manufacturer()).unwrap_or_default();
                version = dmidecode_string_val(&data.version()).unwrap_or_default();
            }
            _ => {}
        }
    }
    debug!(
        "SMBIOS system: {:?} {:?}, OEM strings: {:?}",
        manufacturer, version, oem_strings
    );
    is_thinkpad_system(&oem_strings, &manufacturer, &version)
}

fn is_thinkpad_system(oem_strings: &[String], manufacturer: &str, version: &str) -> bool {
    if oem_strings.iter().any(|s| s.contains(EC_OEM_STRING)) {
        return true;
    }
    (manufacturer == "LENOVO" || manufacturer == "IBM") && version.contains("ThinkPad")
}

pub fn dmidecode_string_val(s: &SMBiosString) -> Option<String> {
    match s.as_ref() {
        Ok(val) if val.is_empty() => Some("Not Specified".to_owned()),
        Ok(val) => Some(val.to_owned()),
        Err(SMBiosStringError::FieldOutOfBounds) => None,
        Err(SMBiosStringError::InvalidStringNumber(_)) => Some("<BAD INDEX>".to_owned()),
        Err(SMBiosStringError::Utf8(val)) => {
            Some(String::from_utf8_lossy(&val.clone().into_bytes()).to_string())
        }
    }
}

// On Linux this reads either from /dev/mem or sysfs
// On FreeBSD from /dev/mem
pub fn get_smbios() -> Option<SMBiosData> {
    match smbioslib::table_load_from_device() {
        Ok(data) => Some(data),
        Err(ref e) if e.kind() == ErrorKind::PermissionDenied => {
            warn!("Must be root to get SMBIOS data.");
            None
        }
        Err(err) => {
            warn!("Failed to get SMBIOS: {:?}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_thinkpads_by_model() {
        assert!(is_thinkpad_system(&[], "LENOVO", "ThinkPad T43"));
        assert!(is_thinkpad_system(&[], "IBM", "ThinkPad X40"));
        assert!(is_thinkpad_system(&[], "IBM", "ThinkPad A30"));
        assert!(!is_thinkpad_system(&[], "LENOVO", "IdeaPad 5"));
        assert!(!is_thinkpad_system(&[], "Framework", "ThinkPad"));
    }

    #[test]
    fn recognizes_ec_oem_string() {
        let oem = vec![
            "Not Specified".to_string(),
            "IBM ThinkPad Embedded Controller -[1RHT71WW-3.04    ]-".to_string(),
        ];
        assert!(is_thinkpad_system(&oem, "LENOVO", "Not Available"));
        assert!(is_thinkpad_system(&oem, "", ""));
        let other = vec!["Framework EC".to_string()];
        assert!(!is_thinkpad_system(&other, "LENOVO", "Not Available"));
    }
}
