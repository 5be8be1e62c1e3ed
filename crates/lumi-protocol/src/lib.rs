// lumi-protocol: Lumi-Chat wire protocol types and serialization.
//
// Every WebSocket text frame carries one Packet envelope with a numeric
// opcode.  Payloads are typed per opcode; the ClientFrame / ServerFrame
// enums make dispatch total on both peers.

pub mod frames;
pub mod internal;
pub mod model;
pub mod packet;

pub use frames::{
    ChatMessageAckData, ChatMessageData, ClientFrame, KickedOfflineData, LoginData,
    LoginResponseData, OfflineMessage, OfflineSyncAckData, OfflineSyncCompleteData,
    OfflineSyncResponseData, OnlineStatusChangeData, OnlineStatusRequestData,
    OnlineStatusResponseData, OnlineStatusSubscribeData, ReactionNotifyData, ReadAckData,
    ReadReceiptNotifyData, RecallAckData, RecallData, RecallNotifyData, ServerErrorData,
    ServerFrame, SyncRequestData, TypingData, TypingNotifyData,
};
pub use internal::{
    AuthenticateRequest, AuthenticateResponse, DeviceRecord, FanoutEvent, GatewayNotice,
    HttpErrorEnvelope, MarkReadOutcome, MarkReadRequest, MessageBatchRequest, OfflineAckRequest,
    OfflineAckResponse, OfflineEnqueue, OfflineEnqueueRequest, OfflineEntry,
    OfflinePendingResponse, ParticipantsResponse, ReapResponse, RecallOutcome,
    SendMessageRequest, UpsertDeviceRequest,
};
pub use model::{
    ChatMessage, ConversationKind, ConversationUpdate, DeviceType, MsgType, PresenceStatus,
    ReadStatusUpdate, RecallRecord, SyncDelta,
};
pub use packet::{Opcode, Packet, ProtocolError, SeqGen, MAX_FRAME_BYTES_DEFAULT};
