//! CDAP message model for the layer-management flow.
//!
//! Enrollment is driven by request/response CDAP operations carrying RIB
//! objects. The enrollment-information record crosses the wire as a fixed
//! msgpack array; the schema, not the codec, is the contract.

use rmpv::Value;

use crate::error::EnrollmentError;

/// RIB object classes and names exchanged during enrollment.
pub mod obj {
    pub const ENROLLMENT_INFO_CLASS: &str = "enrollmentinformation";
    pub const ENROLLMENT_INFO_NAME: &str = "/difmanagement/enrollment";

    pub const ADDRESS_CLASS: &str = "address";
    pub const ADDRESS_NAME: &str = "/difmanagement/naming/address";

    pub const OPERATIONAL_STATUS_CLASS: &str = "operationalstatus";
    pub const OPERATIONAL_STATUS_NAME: &str = "/difmanagement/operationalstatus";

    pub const DATA_TRANSFER_CONSTANTS_CLASS: &str = "datatransferconstants";
    pub const DATA_TRANSFER_CONSTANTS_NAME: &str = "/dif/efcp/datatransferconstants";

    pub const QOS_CUBE_SET_CLASS: &str = "qoscubeset";
    pub const QOS_CUBE_SET_NAME: &str = "/dif/efcp/qoscubes";

    pub const WHATEVERCAST_NAME_SET_CLASS: &str = "whatevercastnameset";
    pub const WHATEVERCAST_NAME_SET_NAME: &str = "/difmanagement/naming/whatevercastnames";

    pub const NEIGHBOR_SET_CLASS: &str = "neighborset";
    pub const NEIGHBOR_SET_NAME: &str = "/difmanagement/enrollment/neighbors";

    pub const DFT_ENTRY_SET_CLASS: &str = "directoryforwardingtableentryset";
    pub const DFT_ENTRY_SET_NAME: &str = "/dif/resourceallocation/directoryforwardingtable";
}

/// CDAP operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CdapOp {
    Connect,
    ConnectR,
    Release,
    ReleaseR,
    Create,
    Read,
    ReadR,
    Start,
    StartR,
    Stop,
    StopR,
}

impl CdapOp {
    /// Whether this operation is a response.
    #[must_use]
    pub fn is_response(self) -> bool {
        matches!(
            self,
            CdapOp::ConnectR | CdapOp::ReleaseR | CdapOp::ReadR | CdapOp::StartR | CdapOp::StopR
        )
    }
}

/// DIF-wide data-transfer constants pushed during enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTransferConstants {
    pub max_pdu_size: u32,
    pub max_pdu_lifetime_ms: u32,
    pub address_length: u8,
    pub cep_id_length: u8,
    pub port_id_length: u8,
    pub qos_id_length: u8,
    pub seq_num_length: u8,
}

impl Default for DataTransferConstants {
    fn default() -> Self {
        Self {
            max_pdu_size: 10_000,
            max_pdu_lifetime_ms: 60_000,
            address_length: 4,
            cep_id_length: 4,
            port_id_length: 4,
            qos_id_length: 4,
            seq_num_length: 4,
        }
    }
}

/// A QoS class advertised by the DIF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QosCube {
    pub id: u32,
    pub name: String,
    pub ordered: bool,
    pub partial_delivery: bool,
    pub max_allowable_gap: u32,
}

/// A whatevercast name and its member set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatevercastName {
    pub name: String,
    pub rule: String,
    pub members: Vec<String>,
}

/// A directory-forwarding-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DftEntry {
    pub app_name: String,
    pub address: u32,
}

/// Neighbor summary pushed during enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborDescriptor {
    pub name: String,
    pub address: u32,
    pub supporting_difs: Vec<String>,
}

/// The enrollment-information record exchanged in START/STOP operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollmentInformation {
    /// The enrollee's address, if it already has a valid one.
    pub address: Option<u32>,
    /// Whether the enrollee may commit before reading every object.
    pub allowed_to_start_early: bool,
    /// N-1 DIFs through which the enrollee is reachable.
    pub supporting_difs: Vec<String>,
}

impl EnrollmentInformation {
    /// Serialize to msgpack: `[address | nil, start_early, [difs...]]`.
    pub fn to_msgpack(&self) -> Vec<u8> {
        let address = match self.address {
            Some(a) => Value::from(a as u64),
            None => Value::Nil,
        };
        let difs = Value::Array(
            self.supporting_difs
                .iter()
                .map(|d| Value::String(d.clone().into()))
                .collect(),
        );
        let arr = Value::Array(vec![
            address,
            Value::Boolean(self.allowed_to_start_early),
            difs,
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &arr).expect("msgpack encoding to Vec never fails");
        buf
    }

    /// Deserialize from msgpack bytes.
    pub fn from_msgpack(data: &[u8]) -> Result<Self, EnrollmentError> {
        let value = rmpv::decode::read_value(&mut &data[..])
            .map_err(|e| EnrollmentError::Codec(format!("msgpack decode error: {e}")))?;
        let arr = match value {
            Value::Array(a) if a.len() == 3 => a,
            _ => {
                return Err(EnrollmentError::Codec(
                    "expected 3-element enrollment-information array".into(),
                ));
            }
        };

        let address = match &arr[0] {
            Value::Nil => None,
            v => Some(
                v.as_u64()
                    .and_then(|a| u32::try_from(a).ok())
                    .ok_or_else(|| EnrollmentError::Codec("bad address field".into()))?,
            ),
        };
        let allowed_to_start_early = arr[1]
            .as_bool()
            .ok_or_else(|| EnrollmentError::Codec("bad start-early field".into()))?;
        let supporting_difs = match &arr[2] {
            Value::Array(difs) => difs
                .iter()
                .map(|d| {
                    d.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| EnrollmentError::Codec("bad dif name".into()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(EnrollmentError::Codec("bad supporting-dif list".into())),
        };

        Ok(Self {
            address,
            allowed_to_start_early,
            supporting_difs,
        })
    }
}

/// A RIB object value carried in a CDAP message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ObjValue {
    #[default]
    None,
    Int(i64),
    EnrollmentInfo(EnrollmentInformation),
    Constants(DataTransferConstants),
    QosCubes(Vec<QosCube>),
    WhatevercastNames(Vec<WhatevercastName>),
    Neighbors(Vec<NeighborDescriptor>),
    DftEntries(Vec<DftEntry>),
}

/// A CDAP message on the layer-management flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdapMessage {
    pub op: CdapOp,
    pub invoke_id: u32,
    pub obj_class: String,
    pub obj_name: String,
    pub result: i32,
    pub result_reason: String,
    pub value: ObjValue,
    pub src_ap_name: String,
    pub dst_ap_name: String,
}

impl CdapMessage {
    /// Build a request carrying an object.
    pub fn request(
        op: CdapOp,
        invoke_id: u32,
        obj_class: &str,
        obj_name: &str,
        value: ObjValue,
    ) -> Self {
        Self {
            op,
            invoke_id,
            obj_class: obj_class.to_string(),
            obj_name: obj_name.to_string(),
            result: 0,
            result_reason: String::new(),
            value,
            src_ap_name: String::new(),
            dst_ap_name: String::new(),
        }
    }

    /// Build a response to `invoke_id` with a result code.
    pub fn response(
        op: CdapOp,
        invoke_id: u32,
        result: i32,
        result_reason: &str,
        value: ObjValue,
    ) -> Self {
        Self {
            op,
            invoke_id,
            obj_class: String::new(),
            obj_name: String::new(),
            result,
            result_reason: result_reason.to_string(),
            value,
            src_ap_name: String::new(),
            dst_ap_name: String::new(),
        }
    }

    /// Attach source/destination application-process names.
    pub fn between(mut self, src: &str, dst: &str) -> Self {
        self.src_ap_name = src.to_string();
        self.dst_ap_name = dst.to_string();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrollment_info_roundtrip_with_address() {
        let ei = EnrollmentInformation {
            address: Some(42),
            allowed_to_start_early: true,
            supporting_difs: vec!["ethdif".into(), "wifidif".into()],
        };
        let decoded = EnrollmentInformation::from_msgpack(&ei.to_msgpack()).unwrap();
        assert_eq!(decoded, ei);
    }

    #[test]
    fn enrollment_info_roundtrip_without_address() {
        let ei = EnrollmentInformation {
            address: None,
            allowed_to_start_early: false,
            supporting_difs: Vec::new(),
        };
        let decoded = EnrollmentInformation::from_msgpack(&ei.to_msgpack()).unwrap();
        assert_eq!(decoded, ei);
    }

    #[test]
    fn enrollment_info_wire_layout() {
        // [nil, false, []] is exactly a 3-element msgpack array.
        let ei = EnrollmentInformation::default();
        let bytes = ei.to_msgpack();
        assert_eq!(bytes[0], 0x93); // fixarray of 3
        assert_eq!(bytes[1], 0xC0); // nil
        assert_eq!(bytes[2], 0xC2); // false
        assert_eq!(bytes[3], 0x90); // empty fixarray
    }

    #[test]
    fn enrollment_info_rejects_garbage() {
        assert!(EnrollmentInformation::from_msgpack(&[]).is_err());
        assert!(EnrollmentInformation::from_msgpack(&[0xDE, 0xAD]).is_err());

        // Wrong arity.
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::Array(vec![Value::Nil])).unwrap();
        assert!(EnrollmentInformation::from_msgpack(&buf).is_err());

        // Wrong type for start-early.
        buf.clear();
        rmpv::encode::write_value(
            &mut buf,
            &Value::Array(vec![
                Value::Nil,
                Value::String("yes".into()),
                Value::Array(vec![]),
            ]),
        )
        .unwrap();
        assert!(EnrollmentInformation::from_msgpack(&buf).is_err());
    }

    #[test]
    fn op_response_classification() {
        assert!(CdapOp::ConnectR.is_response());
        assert!(CdapOp::StopR.is_response());
        assert!(!CdapOp::Connect.is_response());
        assert!(!CdapOp::Create.is_response());
    }

    #[test]
    fn message_builders() {
        let req = CdapMessage::request(
            CdapOp::Read,
            7,
            obj::ADDRESS_CLASS,
            obj::ADDRESS_NAME,
            ObjValue::None,
        )
        .between("ipcp-a", "ipcp-b");
        assert_eq!(req.invoke_id, 7);
        assert_eq!(req.obj_class, obj::ADDRESS_CLASS);
        assert_eq!(req.src_ap_name, "ipcp-a");
        assert_eq!(req.result, 0);

        let resp = CdapMessage::response(CdapOp::ReadR, 7, -1, "no such object", ObjValue::None);
        assert_eq!(resp.result, -1);
        assert!(resp.op.is_response());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_dif_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9.]{0,24}"
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn enrollment_info_roundtrip(
            address in proptest::option::of(any::<u32>()),
            start_early in any::<bool>(),
            difs in proptest::collection::vec(arb_dif_name(), 0..8),
        ) {
            let info = EnrollmentInformation {
                address,
                allowed_to_start_early: start_early,
                supporting_difs: difs,
            };
            let decoded = EnrollmentInformation::from_msgpack(&info.to_msgpack()).unwrap();
            prop_assert_eq!(decoded, info);
        }
    }
}
