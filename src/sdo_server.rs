use std::mem;
use std::sync::{Arc, Mutex};

use crate::cmd_header::{
    SdoInitiateCmd, SdoSegmentCmd, COMMAND_MASK, EXPEDITED, NO_MORE_DATA, REQUEST_ABORTED,
    REQUEST_BLOCK_DOWNLOAD, REQUEST_BLOCK_UPLOAD, REQUEST_DOWNLOAD, REQUEST_SEGMENT_DOWNLOAD,
    REQUEST_SEGMENT_UPLOAD, REQUEST_UPLOAD, RESPONSE_ABORTED, RESPONSE_DOWNLOAD,
    RESPONSE_SEGMENT_DOWNLOAD, RESPONSE_SEGMENT_UPLOAD, RESPONSE_UPLOAD, SIZE_SPECIFIED, TOGGLE_BIT,
};
use crate::constant::{COB_FUNC_RECEIVE_SDO, COB_FUNC_TRANSMIT_SDO, SDO_MAX_DOWNLOAD_SIZE};
use crate::error::{AbortCode, Error, Result};
use crate::network::Network;
use crate::util::flatten;
use crate::{debug, error, info, warn};

/// Dictionary access needed to serve SDO requests.
pub trait ServerStore {
    fn get_data(&self, index: u16, sub_index: u8, check_readable: bool) -> Result<Vec<u8>>;
    fn set_data(&self, index: u16, sub_index: u8, data: &[u8], check_writable: bool) -> Result<()>;

    /// Width of a fixed-size entry, used when an expedited download does
    /// not indicate its size.
    fn data_size(&self, _index: u16, _sub_index: u8) -> Option<usize> {
        None
    }
}

/// Transfer state of one SDO server channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ServerState {
    #[default]
    Idle,
    Upload {
        index: u16,
        sub_index: u8,
        buffer: Vec<u8>,
        offset: usize,
        toggle: u8,
    },
    Download {
        index: u16,
        sub_index: u8,
        buffer: Vec<u8>,
        size: Option<usize>,
        toggle: u8,
    },
}

pub(crate) fn sdo_frame(cmd: u8, index: u16, sub_index: u8, data: &[u8]) -> [u8; 8] {
    flatten(&[&[cmd], &index.to_le_bytes(), &[sub_index], data])
}

pub(crate) fn abort_frame(index: u16, sub_index: u8, code: u32) -> [u8; 8] {
    sdo_frame(RESPONSE_ABORTED, index, sub_index, &code.to_le_bytes())
}

impl ServerState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ServerState::Idle)
    }

    /// Process one request frame.
    ///
    /// Returns the next state and the response to send, if any. Every error
    /// turns into an abort response and leaves the server idle.
    pub fn step(self, request: &[u8], store: &dyn ServerStore) -> (ServerState, Option<[u8; 8]>) {
        if request.is_empty() {
            warn!("Dropping empty SDO request");
            return (self, None);
        }
        let req = flatten(&[request]);
        let cmd = req[0];
        let (frame_index, frame_sub) = (u16::from_le_bytes([req[1], req[2]]), req[3]);
        let (abort_index, abort_sub) = match &self {
            ServerState::Upload { index, sub_index, .. } | ServerState::Download { index, sub_index, .. }
                if matches!(cmd & COMMAND_MASK, REQUEST_SEGMENT_UPLOAD | REQUEST_SEGMENT_DOWNLOAD) =>
            {
                (*index, *sub_index)
            }
            _ => (frame_index, frame_sub),
        };

        let result = match cmd & COMMAND_MASK {
            REQUEST_ABORTED => {
                info!("Transfer of {:#06x}:{:02x} aborted by client", frame_index, frame_sub);
                return (ServerState::Idle, None);
            }
            REQUEST_UPLOAD => init_upload(frame_index, frame_sub, store),
            REQUEST_BLOCK_UPLOAD => {
                debug!("Serving block upload of {:#06x}:{:02x} as regular upload", frame_index, frame_sub);
                init_upload(frame_index, frame_sub, store)
            }
            REQUEST_DOWNLOAD => init_download(frame_index, frame_sub, &req, store),
            REQUEST_BLOCK_DOWNLOAD => Err(AbortCode::CommandSpecifierNotValidOrUnknown.into()),
            REQUEST_SEGMENT_UPLOAD => self.segment_upload(&req),
            REQUEST_SEGMENT_DOWNLOAD => self.segment_download(&req, store),
            _ => Err(AbortCode::CommandSpecifierNotValidOrUnknown.into()),
        };

        match result {
            Ok((state, response)) => (state, Some(response)),
            Err(e) => {
                warn!("Aborting SDO transfer of {:#06x}:{:02x}: {}", abort_index, abort_sub, e);
                (ServerState::Idle, Some(abort_frame(abort_index, abort_sub, e.abort_code())))
            }
        }
    }

    fn segment_upload(self, req: &[u8; 8]) -> Result<(ServerState, [u8; 8])> {
        let ServerState::Upload { index, sub_index, buffer, offset, toggle } = self else {
            return Err(AbortCode::CommandSpecifierNotValidOrUnknown.into());
        };
        if req[0] & TOGGLE_BIT != toggle {
            return Err(Error::ToggleBitError);
        }
        let remaining = &buffer[offset..];
        let len = remaining.len().min(7);
        let mut cmd = RESPONSE_SEGMENT_UPLOAD | toggle | (((7 - len) as u8) << 1);
        let last = len == remaining.len();
        if last {
            cmd |= NO_MORE_DATA;
        }
        let response = flatten(&[&[cmd], &remaining[..len]]);
        if last {
            return Ok((ServerState::Idle, response));
        }
        let next = ServerState::Upload { index, sub_index, buffer, offset: offset + len, toggle: toggle ^ TOGGLE_BIT };
        Ok((next, response))
    }

    fn segment_download(self, req: &[u8; 8], store: &dyn ServerStore) -> Result<(ServerState, [u8; 8])> {
        let ServerState::Download { index, sub_index, mut buffer, size, toggle } = self else {
            return Err(AbortCode::CommandSpecifierNotValidOrUnknown.into());
        };
        let cmd = SdoSegmentCmd::from(req[0]);
        if req[0] & TOGGLE_BIT != toggle {
            return Err(Error::ToggleBitError);
        }
        buffer.extend_from_slice(&req[1..1 + cmd.data_len()]);
        match size {
            Some(expected) if buffer.len() > expected => {
                return Err(Error::SizeMismatch { expected, actual: buffer.len() });
            }
            None if buffer.len() > SDO_MAX_DOWNLOAD_SIZE => return Err(AbortCode::OutOfMemory.into()),
            _ => {}
        }
        let response = flatten(&[&[RESPONSE_SEGMENT_DOWNLOAD | toggle]]);
        if !cmd.c() {
            let next = ServerState::Download { index, sub_index, buffer, size, toggle: toggle ^ TOGGLE_BIT };
            return Ok((next, response));
        }
        if let Some(expected) = size {
            if expected != buffer.len() {
                return Err(Error::SizeMismatch { expected, actual: buffer.len() });
            }
        }
        store.set_data(index, sub_index, &buffer, true)?;
        Ok((ServerState::Idle, response))
    }
}

fn init_upload(index: u16, sub_index: u8, store: &dyn ServerStore) -> Result<(ServerState, [u8; 8])> {
    let data = store.get_data(index, sub_index, true)?;
    if (1..=4).contains(&data.len()) {
        let cmd = RESPONSE_UPLOAD | EXPEDITED | SIZE_SPECIFIED | (((4 - data.len()) as u8) << 2);
        return Ok((ServerState::Idle, sdo_frame(cmd, index, sub_index, &data)));
    }
    let size = (data.len() as u32).to_le_bytes();
    let response = sdo_frame(RESPONSE_UPLOAD | SIZE_SPECIFIED, index, sub_index, &size);
    Ok((ServerState::Upload { index, sub_index, buffer: data, offset: 0, toggle: 0 }, response))
}

fn init_download(index: u16, sub_index: u8, req: &[u8; 8], store: &dyn ServerStore) -> Result<(ServerState, [u8; 8])> {
    let cmd = SdoInitiateCmd::from(req[0]);
    let response = sdo_frame(RESPONSE_DOWNLOAD, index, sub_index, &[]);
    if cmd.e() {
        let mut len = cmd.expedited_len();
        if !cmd.s() {
            if let Some(size) = store.data_size(index, sub_index) {
                len = len.min(size);
            }
        }
        store.set_data(index, sub_index, &req[4..4 + len], true)?;
        return Ok((ServerState::Idle, response));
    }
    let size = cmd.s().then(|| u32::from_le_bytes([req[4], req[5], req[6], req[7]]) as usize);
    if size.is_some_and(|s| s > SDO_MAX_DOWNLOAD_SIZE) {
        return Err(AbortCode::OutOfMemory.into());
    }
    let buffer = Vec::with_capacity(size.unwrap_or(0));
    Ok((ServerState::Download { index, sub_index, buffer, size, toggle: 0 }, response))
}

/// SDO server channel of a local node.
pub struct SdoServer {
    rx_cobid: u32,
    tx_cobid: u32,
    network: Arc<Network>,
    state: Mutex<ServerState>,
}

impl SdoServer {
    pub fn new(node_id: u8, network: Arc<Network>) -> Self {
        SdoServer {
            rx_cobid: COB_FUNC_RECEIVE_SDO + node_id as u32,
            tx_cobid: COB_FUNC_TRANSMIT_SDO + node_id as u32,
            network,
            state: Mutex::new(ServerState::Idle),
        }
    }

    pub fn rx_cobid(&self) -> u32 {
        self.rx_cobid
    }

    pub fn tx_cobid(&self) -> u32 {
        self.tx_cobid
    }

    pub fn state(&self) -> ServerState {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub(crate) fn on_request(&self, data: &[u8], store: &dyn ServerStore) {
        let response = {
            let Ok(mut state) = self.state.lock() else {
                error!("SDO server state poisoned");
                return;
            };
            let current = mem::take(&mut *state);
            let (next, response) = current.step(data, store);
            *state = next;
            response
        };
        if let Some(response) = response {
            debug!("To send SDO response frame: {:02x?}", response);
            if let Err(e) = self.network.send_message(self.tx_cobid, &response) {
                error!("Failed to send SDO response: {}", e);
            }
        }
    }

    /// Drop any transfer in progress.
    pub(crate) fn reset(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = ServerState::Idle;
        }
    }
}
