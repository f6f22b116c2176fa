use super::{Error, HandlerFn, MessageHandlers, UciCore};
use crate::{
    block::Block,
    configs::DeviceInfo,
    message::MessageWriter,
    packet::{core_oid, gid, MessageId},
    Status,
};

/// Handlers of the core group answering from a [`DeviceInfo`]
///
/// `CORE_DEVICE_RESET` answers `OK` then resets the device state, which
/// notifies `READY`. `CORE_GET_DEVICE_INFO` reports the versions and vendor
/// information.
pub fn core_handlers(info: DeviceInfo) -> MessageHandlers<DeviceInfo> {
    MessageHandlers::new(
        &[
            (
                MessageId::command(gid::CORE, core_oid::DEVICE_RESET),
                device_reset as HandlerFn<DeviceInfo>,
            ),
            (
                MessageId::command(gid::CORE, core_oid::GET_DEVICE_INFO),
                get_device_info,
            ),
        ],
        info,
    )
}

fn device_reset(
    core: &mut UciCore,
    _: &mut DeviceInfo,
    id: MessageId,
    _: Option<Block>,
) -> Result<(), Error> {
    core.send_status(id, Status::OK)?;
    core.reset_device_state()
}

fn get_device_info(
    core: &mut UciCore,
    info: &mut DeviceInfo,
    id: MessageId,
    _: Option<Block>,
) -> Result<(), Error> {
    let vendor = &info.vendor_info[..info.vendor_info.len().min(u8::MAX as usize)];

    let mut writer = MessageWriter::new();
    writer
        .put_u8(Status::OK as u8)
        .put_u16_le(info.uci_version)
        .put_u16_le(info.mac_version)
        .put_u16_le(info.phy_version)
        .put_u16_le(info.uci_test_version)
        .put_u8(vendor.len() as u8)
        .put_slice(vendor);

    let payload = writer.to_block(core.allocator())?;
    core.send_message(id.to_response(), payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{block::HeapAllocator, Uci, UciConfig};

    #[test]
    fn device_info_response() {
        let mut uci = Uci::new(UciConfig::default(), HeapAllocator::new()).unwrap();
        let info = DeviceInfo {
            uci_version: 0x1002,
            vendor_info: alloc::vec![0xDE, 0xAD],
            ..DeviceInfo::default()
        };
        uci.register_handlers(core_handlers(info)).unwrap();

        uci.packet_recv_bytes(&[0x20, 0x02, 0x00, 0x00]).unwrap();
        let packet = uci.packet_send_get_ready().unwrap();
        assert_eq!(
            packet.data(),
            &[
                0x40, 0x02, 0x00, 0x0C, 0x00, 0x02, 0x10, 0x02, 0x00, 0x02, 0x00, 0x02, 0x00,
                0x02, 0xDE, 0xAD
            ]
        );
        uci.packet_send_done(packet, Ok(()));
    }

    #[test]
    fn reset_answers_then_notifies_ready() {
        let mut uci = Uci::new(UciConfig::default(), HeapAllocator::new()).unwrap();
        uci.register_handlers(core_handlers(DeviceInfo::default()))
            .unwrap();
        uci.core()
            .set_device_state_notification(crate::DeviceState::Error)
            .unwrap();
        let packet = uci.packet_send_get_ready().unwrap();
        uci.packet_send_done(packet, Ok(()));

        uci.packet_recv_bytes(&[0x20, 0x00, 0x00, 0x01, 0x00]).unwrap();

        let response = uci.packet_send_get_ready().unwrap();
        assert_eq!(response.data(), &[0x40, 0x00, 0x00, 0x01, 0x00]);
        uci.packet_send_done(response, Ok(()));
        let ntf = uci.packet_send_get_ready().unwrap();
        assert_eq!(ntf.data(), &[0x60, 0x01, 0x00, 0x01, 0x01]);
        uci.packet_send_done(ntf, Ok(()));
        assert_eq!(uci.core().device_state(), crate::DeviceState::Ready);
    }
}
